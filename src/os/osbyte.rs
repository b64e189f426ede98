//! OSBYTE and OSWORD
//!
//! Only the calls that make sense away from BBC hardware do anything. The
//! system variables (OSBYTE 166 to 255) live in a table and read back what
//! was written.

use tracing::trace;

use crate::error::{ErrorKind, Result};
use crate::evaluator::host_id;
use crate::executor::Interpreter;

const OSBYTE_BREAK_ESCAPE: usize = 200;
const OSBYTE_ESCAPE_CHAR: usize = 220;
const OSBYTE_ESCAPE_ACTION: usize = 229;
const OSBYTE_ESCAPE_EFFECTS: usize = 230;

/// Maximum wait accepted by OSBYTE 129, in centiseconds
const MAX_WAIT: i32 = 0x7FFF;

impl Interpreter {
    /// OSBYTE `a` with parameters `x` and `y`. Returns the new `x` and `y`.
    pub(crate) fn osbyte(&mut self, a: i32, x: i32, y: i32) -> Result<(i32, i32)> {
        trace!(a, x, y, "osbyte");
        let (a, x, y) = (a & 0xFF, x & 0xFF, y & 0xFF);
        Ok(match a {
            0 => (self.osbyte_vars[0] as i32, 0),
            4 => {
                self.keyboard.cursor_mode = x as u8;
                (x, y)
            }
            15 => {
                self.keyboard.flush_input();
                (x, y)
            }
            21 => {
                match x {
                    0 => self.keyboard.flush_input(),
                    4..=7 => self.sound.flush_all(),
                    _ => {}
                }
                (x, y)
            }
            106 => {
                self.keyboard.mouse_enabled = x != 0;
                (x, y)
            }
            112 => (self.screen.select_write_bank(x as usize) as i32, y),
            113 => (self.screen.select_display_bank(x as usize) as i32, y),
            128 => {
                // ADVAL: negative buffer numbers arrive as bytes
                let channel = x as u8 as i8 as i32;
                let now = self.video.monotonic();
                let value = match channel {
                    -1 => self.keyboard.buffered() as i32,
                    -8..=-5 => self.sound.free_space((-5 - channel) as usize, now),
                    _ => 0,
                };
                (value & 0xFF, (value >> 8) & 0xFF)
            }
            129 => self.osbyte_inkey(x, y)?,
            134 | 165 => (self.screen.pos(), self.screen.vpos()),
            135 => (self.screen.char_at_cursor() as i32, self.screen.mode().number as i32),
            160 => {
                let value = self.screen.vdu_variable(x as u32).unwrap_or(0);
                (value & 0xFF, (value >> 8) & 0xFF)
            }
            166..=255 => {
                let index = a as usize;
                let old = self.osbyte_vars[index];
                let new = (old & y as u8) ^ x as u8;
                self.osbyte_vars[index] = new;
                match index {
                    OSBYTE_ESCAPE_CHAR => self.keyboard.escape_char = new,
                    OSBYTE_BREAK_ESCAPE | OSBYTE_ESCAPE_ACTION => {
                        // Bit 0 of 200 and any value in 229 turn Escape off
                        self.keyboard.escape_enabled = self.osbyte_vars[OSBYTE_BREAK_ESCAPE] & 1 == 0
                            && self.osbyte_vars[OSBYTE_ESCAPE_ACTION] == 0;
                    }
                    OSBYTE_ESCAPE_EFFECTS => self.keyboard.escape_effects = new == 0,
                    _ => {}
                }
                let next = self.osbyte_vars.get(index + 1).copied().unwrap_or(0);
                (old as i32, next as i32)
            }
            // Font resets, keyboard scans and the like
            _ => (x, y),
        })
    }

    /// OSBYTE 129: timed key read, key scan or the host identity
    fn osbyte_inkey(&mut self, x: i32, y: i32) -> Result<(i32, i32)> {
        if y == 0xFF {
            if x == 0 {
                return Ok((host_id(), 0));
            }
            let down = self.keyboard.key_down((x ^ 0xFF) as u8);
            return Ok(if down { (0xFF, 0xFF) } else { (0, 0) });
        }
        self.screen.flush();
        let wait = (x | y << 8).min(MAX_WAIT) as u32;
        Ok(match self.keyboard.get(Some(wait))? {
            Some(key) => (key as i32, 0),
            None => (0, 0xFF),
        })
    }

    /// OSWORD `a` with its parameter block at `block`
    pub(crate) fn osword(&mut self, a: i32, block: usize) -> Result<()> {
        trace!(a, block, "osword");
        match a {
            1 => {
                let time = self.video.time().to_le_bytes();
                self.mem.write_bytes(block, &time[..5])?;
            }
            2 => {
                let mut bytes = [0u8; 8];
                bytes[..5].copy_from_slice(self.mem.slice(block, 5)?);
                // Sign extend the five byte value
                let time = i64::from_le_bytes(bytes) << 24 >> 24;
                self.video.set_time(time);
            }
            9 => {
                let x = self.mem.peek_word(block)? as i16 as i32;
                let y = self.mem.peek_word(block + 2)? as i16 as i32;
                let (colour, _) = self.screen.point(x, y);
                self.mem.poke(block + 4, if colour < 0 { 0xFF } else { colour as u8 })?;
            }
            10 => {
                let code = self.mem.peek(block)?;
                let rows = self.screen.char_definition(code);
                self.mem.write_bytes(block + 1, &rows)?;
            }
            11 => {
                let logical = self.mem.peek(block)?;
                let (r, g, b) = self.screen.palette_entry(logical as u32);
                self.mem.write_bytes(block + 1, &[16, r, g, b])?;
            }
            12 => {
                let entry = self.mem.slice(block, 5)?.to_vec();
                self.screen.set_palette_entry(entry[0], entry[1], entry[2], entry[3], entry[4]);
            }
            139 => {
                let (col, row) = (self.mem.peek(block)? as usize, self.mem.peek(block + 1)? as usize);
                let c = self.screen.char_at(col, row);
                self.mem.poke(block + 2, c)?;
            }
            140 => {
                let at = self.mem.slice(block, 3)?.to_vec();
                let (x, y) = (self.screen.pos() as u8, self.screen.vpos() as u8);
                self.screen.write(&[31, at[0], at[1], at[2], 31, x, y])?;
            }
            _ => return Err(ErrorKind::Unsupported.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::executor::Interpreter;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    #[test]
    fn test_system_variables() {
        let mut i = interp();
        assert_eq!(i.osbyte(200, 3, 0).unwrap(), (0, 0));
        assert_eq!(i.osbyte(200, 0, 0xFF).unwrap().0, 3);
        // Read without changing: x = 0, y = 255
        assert_eq!(i.osbyte(220, 0, 0xFF).unwrap().0, 27);
    }

    #[test]
    fn test_escape_switches() {
        let mut i = interp();
        i.osbyte(200, 1, 0).unwrap();
        assert!(!i.keyboard.escape_enabled);
        i.osbyte(200, 0, 0).unwrap();
        assert!(i.keyboard.escape_enabled);
        i.osbyte(230, 1, 0).unwrap();
        assert!(!i.keyboard.escape_effects);
    }

    #[test]
    fn test_screen_banks() {
        let mut i = interp();
        i.execute_line(b"MODE 1").unwrap();
        assert_eq!(i.osbyte(112, 2, 0).unwrap().0, 1);
        assert_eq!(i.osbyte(113, 2, 0).unwrap().0, 1);
        assert_eq!(i.screen.banks(), (2, 2));
        // Out of range banks leave the selection alone
        i.osbyte(112, 7, 0).unwrap();
        assert_eq!(i.screen.banks(), (2, 2));
    }

    #[test]
    fn test_cursor_position() {
        let mut i = interp();
        i.execute_line(b"PRINT TAB(5,3);").unwrap();
        assert_eq!(i.osbyte(134, 0, 0).unwrap(), (5, 3));
    }

    #[test]
    fn test_timed_read_times_out() {
        let mut i = interp();
        i.set_keys(b"");
        assert_eq!(i.osbyte(129, 0, 0).unwrap(), (0, 0xFF));
        i.set_keys(b"Q");
        assert_eq!(i.osbyte(129, 10, 0).unwrap(), (b'Q' as i32, 0));
    }

    #[test]
    fn test_osword_clock_and_char() {
        let mut i = interp();
        i.execute_line(b"DIM B% 16:TIME=12345").unwrap();
        let block = i.vars.get_value("B%").unwrap().to_i64().unwrap() as usize;
        i.osword(1, block).unwrap();
        let time = i.mem.peek_int(block).unwrap();
        assert!((12345..12345 + 100).contains(&time));
        i.mem.poke(block, b'A').unwrap();
        i.osword(10, block).unwrap();
        assert_ne!(i.mem.slice(block + 1, 8).unwrap(), &[0u8; 8]);
        assert!(i.osword(99, block).is_err());
    }
}
