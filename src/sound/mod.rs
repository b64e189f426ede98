//! Sound scheduling
//!
//! Each channel has a ring of [`QUEUE_SIZE`] notes indexed by a read and a
//! write position. Notes play one after another; the queue is drained
//! against the centisecond clock whenever it is looked at, so no audio
//! thread is needed to keep `ADVAL` and `SOUND` honest.

use tracing::{debug, trace};

use crate::error::{ErrorKind, Result};

pub const CHANNELS: usize = 8;
pub const QUEUE_SIZE: usize = 4;
pub const ENVELOPES: usize = 16;
/// Centiseconds per unit of `SOUND` duration
const DURATION_UNIT: u64 = 5;
/// Duration used for notes of duration -1, which last until flushed
const FOREVER: u64 = u64::MAX / 4;

/// A queued note
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    /// Volume (-15..0) or envelope number (1..16)
    pub amplitude: i32,
    pub pitch: i32,
    /// Centisecond clock time the note starts and ends
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Default)]
struct Queue {
    notes: [Option<Note>; QUEUE_SIZE],
    read: usize,
    write: usize,
}

impl Queue {
    fn len(&self) -> usize {
        (self.write + QUEUE_SIZE * 2 - self.read) % (QUEUE_SIZE * 2)
    }

    fn last_end(&self) -> Option<u64> {
        if self.len() == 0 {
            return None;
        }
        let last = (self.write + QUEUE_SIZE * 2 - 1) % (QUEUE_SIZE * 2);
        self.notes[last % QUEUE_SIZE].map(|n| n.end)
    }

    fn push(&mut self, note: Note) -> bool {
        if self.len() == QUEUE_SIZE {
            return false;
        }
        self.notes[self.write % QUEUE_SIZE] = Some(note);
        self.write = (self.write + 1) % (QUEUE_SIZE * 2);
        true
    }

    /// Drop notes that have finished by `now`
    fn drain(&mut self, now: u64) {
        while self.len() > 0 {
            let slot = self.read % QUEUE_SIZE;
            match self.notes[slot] {
                Some(note) if note.end <= now => {
                    trace!(pitch = note.pitch, "note finished");
                    self.notes[slot] = None;
                    self.read = (self.read + 1) % (QUEUE_SIZE * 2);
                }
                _ => break,
            }
        }
    }

    fn flush(&mut self) {
        *self = Queue::default();
    }
}

/// Sound system state
#[derive(Debug, Clone)]
pub struct Sound {
    pub enabled: bool,
    /// Master volume, 1 to 127
    pub volume: i32,
    /// Channels in use, 1 to 8
    pub voices: usize,
    pub tempo: i32,
    pub beats: i32,
    stereo: [i32; CHANNELS],
    voice_names: Vec<String>,
    queues: Vec<Queue>,
    envelopes: Vec<[i32; 13]>,
}

impl Default for Sound {
    fn default() -> Self {
        Self::new()
    }
}

impl Sound {
    pub fn new() -> Self {
        Self {
            enabled: true,
            volume: 127,
            voices: 1,
            tempo: 0x1000,
            beats: 0,
            stereo: [0; CHANNELS],
            voice_names: vec!["WaveSynth-Beep".to_string(); CHANNELS],
            queues: vec![Queue::default(); CHANNELS],
            envelopes: vec![[0; 13]; ENVELOPES],
        }
    }

    /// Map a `SOUND` channel number (1 to 8, 0 taken as 1) to a queue
    fn queue_index(&self, channel: i32) -> Result<usize> {
        let n = (channel & 0x0F) as usize;
        let index = n.saturating_sub(1);
        if index >= CHANNELS {
            return Err(ErrorKind::BadSound.into());
        }
        Ok(index)
    }

    /// Queue a note. Returns false if the channel's queue is full and the
    /// caller must wait. Bit 4 of the channel number flushes the queue
    /// first.
    pub fn sound(&mut self, channel: i32, amplitude: i32, pitch: i32, duration: i32, now: u64) -> Result<bool> {
        let index = self.queue_index(channel)?;
        if !(-15..=ENVELOPES as i32).contains(&amplitude) || !(0..=0x7FFF).contains(&pitch) {
            return Err(ErrorKind::BadSound.into());
        }
        let queue = &mut self.queues[index];
        if channel & 0x10 != 0 {
            queue.flush();
        }
        queue.drain(now);
        if !self.enabled {
            return Ok(true);
        }
        let start = queue.last_end().map_or(now, |end| end.max(now));
        let length = match duration {
            d if d < 0 => FOREVER,
            d => (d as u64 & 0xFF) * DURATION_UNIT,
        };
        let note = Note { amplitude, pitch, start, end: start + length };
        let queued = queue.push(note);
        if queued {
            debug!(channel = index + 1, amplitude, pitch, duration, "note queued");
        }
        Ok(queued)
    }

    /// Free slots in a channel's queue (`ADVAL(-5)` to `ADVAL(-8)` for
    /// channels 1 to 4)
    pub fn free_space(&mut self, channel: usize, now: u64) -> i32 {
        match self.queues.get_mut(channel) {
            Some(queue) => {
                queue.drain(now);
                (QUEUE_SIZE - queue.len()) as i32
            }
            None => 0,
        }
    }

    /// The note sounding on a channel, if any
    pub fn playing(&mut self, channel: usize, now: u64) -> Option<Note> {
        let queue = self.queues.get_mut(channel)?;
        queue.drain(now);
        if queue.len() == 0 {
            return None;
        }
        queue.notes[queue.read % QUEUE_SIZE].filter(|n| n.start <= now)
    }

    /// Silence every channel (`*FX 15` and escape acknowledgement)
    pub fn flush_all(&mut self) {
        for queue in self.queues.iter_mut() {
            queue.flush();
        }
    }

    /// `ENVELOPE n, ...` with 13 parameters
    pub fn envelope(&mut self, n: i32, params: &[i32]) -> Result<()> {
        let slot = usize::try_from(n - 1)
            .ok()
            .and_then(|i| self.envelopes.get_mut(i))
            .ok_or(ErrorKind::BadSound)?;
        if params.len() != 13 {
            return Err(ErrorKind::BadSound.into());
        }
        slot.copy_from_slice(params);
        Ok(())
    }

    pub fn envelope_params(&self, n: i32) -> Option<&[i32; 13]> {
        usize::try_from(n - 1).ok().and_then(|i| self.envelopes.get(i))
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume.clamp(1, 127);
    }

    /// `VOICES n`
    pub fn set_voices(&mut self, voices: i32) -> Result<()> {
        if !(1..=CHANNELS as i32).contains(&voices) {
            return Err(ErrorKind::BadSound.into());
        }
        self.voices = voices as usize;
        Ok(())
    }

    /// `STEREO channel, position`
    pub fn set_stereo(&mut self, channel: i32, position: i32) -> Result<()> {
        let index = self.queue_index(channel)?;
        self.stereo[index] = position.clamp(-127, 127);
        Ok(())
    }

    /// `VOICE channel, name$`
    pub fn set_voice(&mut self, channel: i32, name: &str) -> Result<()> {
        let index = self.queue_index(channel)?;
        self.voice_names[index] = name.to_string();
        Ok(())
    }

    /// Text for `*Voices`
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, name) in self.voice_names.iter().enumerate().take(self.voices) {
            out.push_str(&format!("{:>2}  {:>4}  {}\r\n", i + 1, self.stereo[i], name));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fills_and_drains() {
        let mut sound = Sound::new();
        for _ in 0..QUEUE_SIZE {
            assert!(sound.sound(1, -15, 100, 10, 0).unwrap());
        }
        assert_eq!(sound.free_space(0, 0), 0);
        assert!(!sound.sound(1, -15, 100, 10, 0).unwrap());
        // Each note lasts 50cs and they play back to back
        assert_eq!(sound.free_space(0, 50), 1);
        assert_eq!(sound.free_space(0, 200), QUEUE_SIZE as i32);
    }

    #[test]
    fn test_notes_play_in_sequence() {
        let mut sound = Sound::new();
        sound.sound(2, -10, 53, 2, 100).unwrap();
        sound.sound(2, -10, 89, 2, 100).unwrap();
        assert_eq!(sound.playing(1, 105).map(|n| n.pitch), Some(53));
        assert_eq!(sound.playing(1, 112).map(|n| n.pitch), Some(89));
        assert_eq!(sound.playing(1, 125), None);
    }

    #[test]
    fn test_flush_bit() {
        let mut sound = Sound::new();
        sound.sound(1, -15, 1, -1, 0).unwrap();
        assert_eq!(sound.free_space(0, 10_000), 3);
        sound.sound(0x11, -15, 2, 1, 0).unwrap();
        assert_eq!(sound.playing(0, 1).map(|n| n.pitch), Some(2));
    }

    #[test]
    fn test_bad_parameters() {
        let mut sound = Sound::new();
        assert_eq!(sound.sound(9, -15, 1, 1, 0).unwrap_err().kind, ErrorKind::BadSound);
        assert_eq!(sound.sound(1, -16, 1, 1, 0).unwrap_err().kind, ErrorKind::BadSound);
        assert!(sound.envelope(17, &[0; 13]).is_err());
        assert!(sound.envelope(1, &[0; 12]).is_err());
        sound.envelope(2, &[1; 13]).unwrap();
        assert_eq!(sound.envelope_params(2), Some(&[1; 13]));
        assert!(sound.set_voices(9).is_err());
    }

    #[test]
    fn test_disabled_sound_queues_nothing() {
        let mut sound = Sound::new();
        sound.enabled = false;
        assert!(sound.sound(1, -15, 1, 100, 0).unwrap());
        assert_eq!(sound.free_space(0, 0), QUEUE_SIZE as i32);
    }
}
