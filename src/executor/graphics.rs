//! Graphics and sound statements
//!
//! Almost everything here is sugar for a VDU sequence or a `PLOT` code, and
//! goes through [`crate::vdu::Screen`] the same way `VDU` output does.

use std::thread;
use std::time::Duration;

use tracing::debug;

use super::Interpreter;
use crate::error::{ErrorKind, Result};
use crate::tokenizer::*;
use crate::variables::Value;

const PLOT_MOVE: u8 = 4;
const PLOT_DRAW: u8 = 5;
const PLOT_MOVE_BY: u8 = 0;
const PLOT_DRAW_BY: u8 = 1;
const PLOT_POINT: u8 = 69;
const PLOT_POINT_BY: u8 = 65;
const PLOT_RECTANGLE_FILL: u8 = 0x65;
const PLOT_FLOOD: u8 = 0x85;
const PLOT_FLOOD_BY: u8 = 0x81;
const PLOT_CIRCLE: u8 = 0x95;
const PLOT_CIRCLE_FILL: u8 = 0x9D;
const PLOT_BLOCK_MOVE: u8 = 0xBD;
const PLOT_BLOCK_COPY: u8 = 0xBE;
const PLOT_ELLIPSE: u8 = 0xC5;
const PLOT_ELLIPSE_FILL: u8 = 0xCD;

/// Delay between polls while `WAIT` or a full sound queue holds things up
const POLL_DELAY: Duration = Duration::from_millis(10);

/// `VDU 23,17` selectors for `TINT`
const TINT_TEXT_FG: u8 = 0;
const TINT_TEXT_BG: u8 = 1;
const TINT_GRAPHICS_FG: u8 = 2;
const TINT_GRAPHICS_BG: u8 = 3;

impl Interpreter {
    /// Comma separated integer arguments up to the end of the statement
    /// or a keyword
    fn int_list(&mut self) -> Result<Vec<i32>> {
        let mut values = vec![self.eval_i32()?];
        while self.accept(b',') {
            values.push(self.eval_i32()?);
        }
        Ok(values)
    }

    /// `x, y`
    fn coordinates(&mut self) -> Result<(i32, i32)> {
        let x = self.eval_i32()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let y = self.eval_i32()?;
        Ok((x, y))
    }

    fn plot_at(&mut self, code: u8, (x, y): (i32, i32)) -> Result<()> {
        self.screen.plot(code, x, y)
    }

    fn tint_command(&mut self, which: u8, tint: i32) -> Result<()> {
        let mut sequence = [0u8; 10];
        sequence[0] = 23;
        sequence[1] = 17;
        sequence[2] = which;
        sequence[3] = tint as u8;
        self.screen.write(&sequence)
    }

    /// `TINT` after a colour number, if present
    fn optional_tint(&mut self) -> Result<Option<i32>> {
        if self.accept_extended(TOKEN_XSTATEMENT, XSTMT_TINT) {
            Ok(Some(self.eval_i32()?))
        } else {
            Ok(None)
        }
    }

    /// `MODE n` or `MODE width, height, bpp[, rate]`
    pub(crate) fn mode_statement(&mut self) -> Result<()> {
        let values = self.int_list()?;
        self.check_end()?;
        match values[..] {
            [number] => {
                let number = number as u32 & 0x7F;
                if let Err(e) = self.screen.set_mode(number) {
                    if self.config.failover_mode < 0 {
                        return Err(e);
                    }
                    debug!(number, failover = self.config.failover_mode, "mode not available");
                    self.screen.set_mode(self.config.failover_mode as u32)?;
                }
            }
            [width, height, bpp] | [width, height, bpp, _] => {
                let colours = match bpp {
                    1 => 2,
                    2 => 4,
                    4 => 16,
                    8 => 256,
                    24 | 32 => 1 << 24,
                    _ => return Err(ErrorKind::BadMode.into()),
                };
                if width <= 0 || height <= 0 {
                    return Err(ErrorKind::BadModeSc.into());
                }
                self.screen.set_custom_mode(width as usize, height as usize, colours)?;
            }
            _ => return Err(ErrorKind::Syntax.into()),
        }
        Ok(())
    }

    /// `COLOUR n [TINT t]`, `COLOUR n, p`, `COLOUR n, r, g, b` and
    /// `COLOUR r, g, b`
    pub(crate) fn colour_statement(&mut self) -> Result<()> {
        let values = self.int_list()?;
        let tint = self.optional_tint()?;
        self.check_end()?;
        match values[..] {
            [colour] => {
                self.screen.write(&[17, colour as u8])?;
                if let Some(tint) = tint {
                    let which = if colour & 0x80 != 0 { TINT_TEXT_BG } else { TINT_TEXT_FG };
                    self.tint_command(which, tint)?;
                }
            }
            [logical, physical] => self.screen.write(&[19, logical as u8, physical as u8, 0, 0, 0])?,
            [r, g, b] => {
                let (colour, tint) = self.screen.nearest_colour(r as u8, g as u8, b as u8);
                self.screen.write(&[17, colour])?;
                self.tint_command(TINT_TEXT_FG, tint as i32)?;
            }
            [logical, r, g, b] => self.screen.write(&[19, logical as u8, 16, r as u8, g as u8, b as u8])?,
            _ => return Err(ErrorKind::Syntax.into()),
        }
        Ok(())
    }

    /// `GCOL [action,] colour [TINT t]` and `GCOL [action,] r, g, b`
    pub(crate) fn gcol_statement(&mut self) -> Result<()> {
        let values = self.int_list()?;
        let tint = self.optional_tint()?;
        self.check_end()?;
        let (action, colour, tint) = match values[..] {
            [colour] => (0, colour as u8, tint),
            [action, colour] => (action, colour as u8, tint),
            [r, g, b] => {
                let (colour, tint) = self.screen.nearest_colour(r as u8, g as u8, b as u8);
                (0, colour, Some(tint as i32))
            }
            [action, r, g, b] => {
                let (colour, tint) = self.screen.nearest_colour(r as u8, g as u8, b as u8);
                (action, colour, Some(tint as i32))
            }
            _ => return Err(ErrorKind::Syntax.into()),
        };
        self.screen.write(&[18, action as u8, colour])?;
        if let Some(tint) = tint {
            let which = if colour & 0x80 != 0 { TINT_GRAPHICS_BG } else { TINT_GRAPHICS_FG };
            self.tint_command(which, tint)?;
        }
        Ok(())
    }

    /// `TINT which, tint`
    pub(crate) fn tint_statement(&mut self) -> Result<()> {
        let (which, tint) = self.coordinates()?;
        self.check_end()?;
        if !(0..=3).contains(&which) {
            return Err(ErrorKind::BadTint.into());
        }
        self.tint_command(which as u8, tint)
    }

    pub(crate) fn move_statement(&mut self) -> Result<()> {
        let code = if self.accept_word(b"BY") { PLOT_MOVE_BY } else { PLOT_MOVE };
        let at = self.coordinates()?;
        self.check_end()?;
        self.plot_at(code, at)
    }

    pub(crate) fn draw_statement(&mut self) -> Result<()> {
        let code = if self.accept_word(b"BY") { PLOT_DRAW_BY } else { PLOT_DRAW };
        let at = self.coordinates()?;
        self.check_end()?;
        self.plot_at(code, at)
    }

    /// `PLOT code, x, y` or `PLOT x, y`
    pub(crate) fn plot_statement(&mut self) -> Result<()> {
        let values = self.int_list()?;
        self.check_end()?;
        match values[..] {
            [x, y] => self.screen.plot(PLOT_POINT, x, y),
            [code, x, y] => self.screen.plot(code as u8, x, y),
            _ => Err(ErrorKind::Syntax.into()),
        }
    }

    /// `LINE x1, y1, x2, y2`
    pub(crate) fn line_statement(&mut self) -> Result<()> {
        let from = self.coordinates()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let to = self.coordinates()?;
        self.check_end()?;
        self.plot_at(PLOT_MOVE, from)?;
        self.plot_at(PLOT_DRAW, to)
    }

    /// `POINT x, y`, `POINT BY x, y` or `POINT TO x, y`, the last of which
    /// moves the mouse pointer
    pub(crate) fn point_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_TO) {
            let (x, y) = self.coordinates()?;
            self.check_end()?;
            self.keyboard.warp_mouse(x, y);
            return Ok(());
        }
        let code = if self.accept_word(b"BY") { PLOT_POINT_BY } else { PLOT_POINT };
        let at = self.coordinates()?;
        self.check_end()?;
        self.plot_at(code, at)
    }

    /// `CIRCLE [FILL] x, y, r`
    pub(crate) fn circle_statement(&mut self) -> Result<()> {
        let fill = self.accept_extended(TOKEN_XSTATEMENT, XSTMT_FILL);
        let (x, y) = self.coordinates()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let radius = self.eval_i32()?;
        self.check_end()?;
        self.plot_at(PLOT_MOVE, (x, y))?;
        let code = if fill { PLOT_CIRCLE_FILL } else { PLOT_CIRCLE };
        self.plot_at(code, (x + radius, y))
    }

    /// `ELLIPSE [FILL] x, y, major, minor[, angle]`
    pub(crate) fn ellipse_statement(&mut self) -> Result<()> {
        let fill = self.accept_extended(TOKEN_XSTATEMENT, XSTMT_FILL);
        let (x, y) = self.coordinates()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let major = self.eval_f64()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let minor = self.eval_f64()?;
        let angle = if self.accept(b',') { self.eval_f64()? } else { 0.0 };
        self.check_end()?;
        let (slice, shear, height) = ellipse_points(major, minor, angle);
        self.plot_at(PLOT_MOVE, (x, y))?;
        self.plot_at(PLOT_MOVE, (x + slice, y))?;
        let code = if fill { PLOT_ELLIPSE_FILL } else { PLOT_ELLIPSE };
        self.plot_at(code, (x + shear, y + height))
    }

    /// `RECTANGLE [FILL] x, y, w[, h] [TO x2, y2]`
    pub(crate) fn rectangle_statement(&mut self) -> Result<()> {
        let fill = self.accept_extended(TOKEN_XSTATEMENT, XSTMT_FILL);
        let (x, y) = self.coordinates()?;
        self.expect(b',', ErrorKind::CoMiss)?;
        let width = self.eval_i32()?;
        let height = if self.accept(b',') { self.eval_i32()? } else { width };
        let dest = if self.accept(TOKEN_TO) { Some(self.coordinates()?) } else { None };
        self.check_end()?;
        let (right, top) = (x + width, y + height);
        self.plot_at(PLOT_MOVE, (x, y))?;
        match dest {
            Some(dest) => {
                self.plot_at(PLOT_MOVE, (right, top))?;
                self.plot_at(if fill { PLOT_BLOCK_MOVE } else { PLOT_BLOCK_COPY }, dest)
            }
            None if fill => self.plot_at(PLOT_RECTANGLE_FILL, (right, top)),
            None => {
                for corner in [(right, y), (right, top), (x, top), (x, y)] {
                    self.plot_at(PLOT_DRAW, corner)?;
                }
                Ok(())
            }
        }
    }

    /// `FILL [BY] x, y`
    pub(crate) fn fill_statement(&mut self) -> Result<()> {
        let code = if self.accept_word(b"BY") { PLOT_FLOOD_BY } else { PLOT_FLOOD };
        let at = self.coordinates()?;
        self.check_end()?;
        self.plot_at(code, at)
    }

    pub(crate) fn origin_statement(&mut self) -> Result<()> {
        let (x, y) = self.coordinates()?;
        self.check_end()?;
        let [x0, x1] = (x as i16).to_le_bytes();
        let [y0, y1] = (y as i16).to_le_bytes();
        self.screen.write(&[29, x0, x1, y0, y1])
    }

    /// `VDU` list: `,` sends a byte, `;` a 16-bit word and `|` nine zeros
    pub(crate) fn vdu_statement(&mut self) -> Result<()> {
        let mut bytes = Vec::new();
        while !self.at_statement_end() {
            if self.accept(b'|') {
                bytes.extend_from_slice(&[0; 9]);
                continue;
            }
            let value = self.eval_word()?;
            if self.accept(b';') {
                bytes.extend_from_slice(&(value as u16).to_le_bytes());
            } else {
                self.accept(b',');
                bytes.push(value as u8);
            }
        }
        self.screen.write(&bytes)
    }

    /// `WAIT` alone waits for the display to catch up; `WAIT n` pauses for
    /// `n` centiseconds while still noticing Escape
    pub(crate) fn wait_statement(&mut self) -> Result<()> {
        if self.at_statement_end() {
            self.screen.flush();
            return Ok(());
        }
        let delay = self.eval_i32()?;
        self.check_end()?;
        self.screen.flush();
        let until = self.video.monotonic() + delay.max(0) as u64;
        while self.video.monotonic() < until {
            self.keyboard.poll();
            self.keyboard.check_escape()?;
            let left = until.saturating_sub(self.video.monotonic()) * 10;
            thread::sleep(POLL_DELAY.min(Duration::from_millis(left)));
        }
        Ok(())
    }

    /// `MOUSE x, y, b[, t]` reads the mouse. `MOUSE TO x, y` moves the
    /// pointer. The pointer shape and bounding box forms are accepted and
    /// have no effect.
    pub(crate) fn mouse_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_ON) || self.accept(TOKEN_OFF) {
            if !self.at_statement_end() {
                self.eval_i32()?;
            }
            return self.check_end();
        }
        if self.accept(TOKEN_TO) {
            let (x, y) = self.coordinates()?;
            self.check_end()?;
            self.keyboard.warp_mouse(x, y);
            return Ok(());
        }
        if self.accept(TOKEN_STEP)
            || self.accept(TOKEN_COLOUR)
            || self.accept_extended(TOKEN_XSTATEMENT, XSTMT_RECTANGLE)
        {
            self.int_list()?;
            return self.check_end();
        }
        let mut targets = vec![self.lvalue()?];
        while self.accept(b',') {
            targets.push(self.lvalue()?);
        }
        self.check_end()?;
        if !(3..=4).contains(&targets.len()) {
            return Err(ErrorKind::Syntax.into());
        }
        let event = self.keyboard.read_mouse(self.video.monotonic());
        let values = [event.x as i64, event.y as i64, event.buttons as i64, event.time as i64];
        for (target, value) in targets.iter().zip(values) {
            if target.is_string() {
                return Err(ErrorKind::TypeNum.into());
            }
            self.assign_lvalue(target, Value::Int(value as i32))?;
        }
        Ok(())
    }

    /// `SOUND channel, amplitude, pitch, duration[, delay]` and
    /// `SOUND ON`/`SOUND OFF`
    pub(crate) fn sound_statement(&mut self) -> Result<()> {
        if self.accept(TOKEN_ON) {
            self.sound.enabled = true;
            return self.check_end();
        }
        if self.accept(TOKEN_OFF) {
            self.sound.enabled = false;
            self.sound.flush_all();
            return self.check_end();
        }
        let values = self.int_list()?;
        self.check_end()?;
        let [channel, amplitude, pitch, duration] = match values[..] {
            [c, a, p, d] | [c, a, p, d, _] => [c, a, p, d],
            _ => return Err(ErrorKind::Syntax.into()),
        };
        while !self.sound.sound(channel, amplitude, pitch, duration, self.video.monotonic())? {
            self.keyboard.poll();
            self.keyboard.check_escape()?;
            thread::sleep(POLL_DELAY);
        }
        Ok(())
    }

    /// `ENVELOPE n, p1, ..., p13`
    pub(crate) fn envelope_statement(&mut self) -> Result<()> {
        let values = self.int_list()?;
        self.check_end()?;
        let (number, params) = values.split_first().ok_or(ErrorKind::Syntax)?;
        self.sound.envelope(*number, params)
    }

    /// `BEATS`, `TEMPO`, `VOICES`, `VOICE` and `STEREO`
    pub(crate) fn music_statement(&mut self, token: u8) -> Result<()> {
        match token {
            XSTMT_BEATS => self.sound.beats = self.eval_i32()?,
            XSTMT_TEMPO => self.sound.tempo = self.eval_i32()?,
            XSTMT_VOICES => {
                let voices = self.eval_i32()?;
                self.sound.set_voices(voices)?;
            }
            XSTMT_VOICE => {
                let channel = self.eval_i32()?;
                self.expect(b',', ErrorKind::CoMiss)?;
                let name = self.eval_string()?;
                self.sound.set_voice(channel, &String::from_utf8_lossy(&name))?;
            }
            _ => {
                let (channel, position) = self.coordinates()?;
                self.sound.set_stereo(channel, position)?;
            }
        }
        self.check_end()
    }
}

/// The three points that describe an ellipse to `PLOT`: the half width of
/// the horizontal slice through the centre, and the offset of the topmost
/// point
fn ellipse_points(major: f64, minor: f64, angle: f64) -> (i32, i32, i32) {
    if angle == 0.0 {
        return (major as i32, 0, minor as i32);
    }
    let (sin, cos) = angle.sin_cos();
    let height = (minor * minor * cos * cos + major * major * sin * sin).sqrt();
    if height == 0.0 {
        return (major as i32, 0, 0);
    }
    let shear = cos * sin * (major * major - minor * minor) / height;
    let slice = major * minor / height;
    (slice as i32, shear as i32, height as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    fn run(interp: &mut Interpreter, lines: &[&str]) -> String {
        for line in lines {
            let _ = interp.execute_line(line.as_bytes());
        }
        interp.output()
    }

    #[test]
    fn test_ellipse_points() {
        assert_eq!(ellipse_points(100.0, 50.0, 0.0), (100, 0, 50));
        let (slice, shear, height) = ellipse_points(100.0, 50.0, std::f64::consts::FRAC_PI_2);
        assert_eq!((slice, height), (50, 100));
        assert_eq!(shear, 0);
    }

    #[test]
    fn test_draw_sets_pixels() {
        let mut i = interp();
        let out = run(&mut i, &["GCOL 1:MOVE 0,0:DRAW 200,0:PRINT ;POINT(100,0);POINT(100,400)"]);
        assert_eq!(out, "\x12\0\x0110\r\n");
    }

    #[test]
    fn test_circle_fill() {
        let mut i = interp();
        let out = run(&mut i, &["GCOL 1:CIRCLE FILL 640,512,100:PRINT ;POINT(640,512);POINT(0,0)"]);
        assert_eq!(out, "\x12\0\x0110\r\n");
    }

    #[test]
    fn test_rectangle_fill_and_origin() {
        let mut i = interp();
        let out = run(
            &mut i,
            &["GCOL 1:ORIGIN 100,100:RECTANGLE FILL 0,0,50,50:PRINT ;POINT(20,20);POINT(-20,-20)"],
        );
        // GCOL and ORIGIN go through the VDU stream and are captured with the text
        assert_eq!(out, "\x12\0\x01\x1d\x64\0\x64\010\r\n");
    }

    #[test]
    fn test_vdu_separators() {
        let mut i = interp();
        let out = run(&mut i, &["VDU 65,66;67|"]);
        // 66 as a word is followed by a zero byte, which VDU ignores
        assert!(out.starts_with("AB"));
        assert!(out.contains('C'));
    }

    #[test]
    fn test_bad_mode() {
        let mut i = interp();
        let out = run(&mut i, &["MODE 99"]);
        assert!(out.contains("Screen mode 99 is not available"));
    }

    #[test]
    fn test_escape_interrupts_wait() {
        let mut i = interp();
        run(&mut i, &["SOUND 1,-15,100,50:SOUND 1,-15,100,50"]);
        let queued = i.sound.free_space(0, i.video.monotonic());
        i.set_keys(b"\x1b");
        let started = std::time::Instant::now();
        let err = i.execute_line(b"WAIT 100").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Escape);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(i.output(), "Escape\r\n");
        // Acknowledging the escape emptied the sound queue
        assert!(i.sound.free_space(0, i.video.monotonic()) > queued);
    }

    #[test]
    fn test_escape_ignored_after_fx_229() {
        let mut i = interp();
        run(&mut i, &["*FX 229,1"]);
        i.set_keys(b"\x1b");
        assert!(i.execute_line(b"WAIT 5").is_ok());
        assert_eq!(run(&mut i, &["PRINT GET"]), "        27\r\n");
    }

    #[test]
    fn test_sound_and_envelope() {
        let mut i = interp();
        let out = run(&mut i, &["SOUND 1,-15,100,1:ENVELOPE 1,1,0,0,0,0,0,0,126,0,0,-126,126,126"]);
        assert_eq!(out, "");
        let out = run(&mut i, &["ENVELOPE 1,2"]);
        assert!(!out.is_empty());
        run(&mut i, &["VOICES 4:STEREO 2,-200"]);
        assert_eq!(i.sound.voices, 4);
    }

    #[test]
    fn test_mouse_reads_position() {
        let mut i = interp();
        run(&mut i, &["MOUSE TO 320,256", "MOUSE X,Y,B"]);
        assert_eq!(run(&mut i, &["PRINT ;X;\",\";Y;\",\";B"]), "320,256,0\r\n");
    }
}
