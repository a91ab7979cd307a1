use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use serde::Serialize;

/// One mono side of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Track {
    Agent,
    Customer,
}

impl Track {
    fn index(self) -> usize {
        match self {
            Track::Agent => 0,
            Track::Customer => 1,
        }
    }
}

impl Display for Track {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Track::Agent => write!(f, "agent"),
            Track::Customer => write!(f, "customer"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InterleaveError {
    #[error("{0} track is already closed")]
    TrackClosed(Track),
    #[error("{0} track is still open")]
    TrackOpen(Track),
}

/// Merges the agent and customer tracks into a two channel stream.
///
/// Each track is an append-only byte queue. Output is emitted only in whole
/// frames of one agent sample followed by one customer sample, so a lagging
/// track holds back output until its matching sample arrives. Bytes that do
/// not yet form a full sample stay queued.
#[derive(Debug)]
pub struct Interleaver {
    sample_width: usize,
    tracks: [VecDeque<u8>; 2],
    closed: [bool; 2],
}

impl Interleaver {
    pub fn new(sample_width: usize) -> Self {
        assert!(sample_width > 0, "sample width must be positive");
        Self {
            sample_width,
            tracks: [VecDeque::new(), VecDeque::new()],
            closed: [false, false],
        }
    }

    pub fn frame_width(&self) -> usize {
        self.sample_width * 2
    }

    /// Appends `bytes` to `track` and returns every frame completed by it.
    pub fn write(&mut self, track: Track, bytes: &[u8]) -> Result<Vec<u8>, InterleaveError> {
        if self.closed[track.index()] {
            return Err(InterleaveError::TrackClosed(track));
        }
        self.tracks[track.index()].extend(bytes);
        Ok(self.drain_frames())
    }

    pub fn close(&mut self, track: Track) {
        self.closed[track.index()] = true;
    }

    pub fn is_closed(&self, track: Track) -> bool {
        self.closed[track.index()]
    }

    /// Bytes still queued on `track` waiting for a partner sample.
    pub fn pending(&self, track: Track) -> usize {
        self.tracks[track.index()].len()
    }

    /// Completes the stream once both tracks are closed, returning how many
    /// queued bytes were dropped because they never formed a full frame.
    pub fn finish(&mut self) -> Result<usize, InterleaveError> {
        for track in [Track::Agent, Track::Customer] {
            if !self.is_closed(track) {
                return Err(InterleaveError::TrackOpen(track));
            }
        }
        let discarded = self.tracks.iter().map(VecDeque::len).sum();
        self.tracks.iter_mut().for_each(VecDeque::clear);
        Ok(discarded)
    }

    fn drain_frames(&mut self) -> Vec<u8> {
        let [agent, customer] = &mut self.tracks;
        let samples = agent.len().min(customer.len()) / self.sample_width;
        let mut out = Vec::with_capacity(samples * self.sample_width * 2);
        for _ in 0..samples {
            out.extend(agent.drain(..self.sample_width));
            out.extend(customer.drain(..self.sample_width));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleaves_in_strict_alternation() {
        let mut interleaver = Interleaver::new(2);
        let a = [0xa0, 0xa0, 0xa1, 0xa1, 0xa2, 0xa2];
        let b = [0xb0, 0xb0, 0xb1, 0xb1, 0xb2, 0xb2];
        assert!(interleaver.write(Track::Agent, &a).unwrap().is_empty());
        let out = interleaver.write(Track::Customer, &b).unwrap();
        assert_eq!(
            out,
            vec![0xa0, 0xa0, 0xb0, 0xb0, 0xa1, 0xa1, 0xb1, 0xb1, 0xa2, 0xa2, 0xb2, 0xb2]
        );
    }

    #[test]
    fn lagging_track_holds_output_without_truncation() {
        let mut interleaver = Interleaver::new(2);
        let mut out = Vec::new();
        out.extend(interleaver.write(Track::Agent, &[1, 1, 2, 2]).unwrap());
        out.extend(interleaver.write(Track::Customer, &[9]).unwrap());
        assert!(out.is_empty());
        out.extend(interleaver.write(Track::Customer, &[9, 8]).unwrap());
        assert_eq!(out, vec![1, 1, 9, 9]);
        out.extend(interleaver.write(Track::Agent, &[3, 3]).unwrap());
        out.extend(interleaver.write(Track::Customer, &[8, 7, 7]).unwrap());
        assert_eq!(out, vec![1, 1, 9, 9, 2, 2, 8, 8, 3, 3, 7, 7]);
        assert_eq!(out.len() % interleaver.frame_width(), 0);
    }

    #[test]
    fn finish_requires_both_tracks_closed() {
        let mut interleaver = Interleaver::new(2);
        interleaver.write(Track::Agent, &[1, 1, 2]).unwrap();
        interleaver.close(Track::Agent);
        assert_eq!(interleaver.finish(), Err(InterleaveError::TrackOpen(Track::Customer)));
        interleaver.close(Track::Customer);
        assert_eq!(interleaver.finish(), Ok(3));
        assert_eq!(interleaver.pending(Track::Agent), 0);
    }

    #[test]
    fn closed_track_rejects_writes() {
        let mut interleaver = Interleaver::new(2);
        interleaver.close(Track::Customer);
        assert_eq!(
            interleaver.write(Track::Customer, &[0, 0]),
            Err(InterleaveError::TrackClosed(Track::Customer))
        );
    }
}
