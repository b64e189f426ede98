//! Operating system interface
//!
//! The `*` command line interpreter, GSTrans string translation, the MOS
//! style OSBYTE and OSWORD calls, and the `SYS` gateway. Commands that are
//! not built in go to the host shell.

mod osbyte;
mod sys;

use std::env;
use std::fs;
use std::path::Path;
use std::process::Command;

use tracing::{debug, warn};

use crate::error::{BasicError, ErrorKind, Result};
use crate::executor::Interpreter;
use crate::video::{AutoRefresh, Request};

pub use sys::{service_name, service_number, XBIT};

/// Translate a GSTrans string: `|X` is Ctrl-X, `|?` is DEL, `|!X` sets the
/// top bit of X, `||` and `|"` stand for themselves. A string in double
/// quotes ends at the closing quote and may contain spaces.
pub fn gstrans(text: &[u8]) -> Result<Vec<u8>> {
    let start = text.iter().position(|&c| c != b' ').unwrap_or(text.len());
    let mut text = &text[start..];
    let quoted = text.first() == Some(&b'"');
    if quoted {
        text = &text[1..];
    }
    let mut out = Vec::with_capacity(text.len());
    let mut pos = 0;
    while pos < text.len() {
        if quoted && text[pos] == b'"' {
            return Ok(out);
        }
        out.push(gstrans_char(text, &mut pos)?);
    }
    if quoted {
        return Err(ErrorKind::QuoteMiss.into());
    }
    Ok(out)
}

fn gstrans_char(text: &[u8], pos: &mut usize) -> Result<u8> {
    let c = text[*pos];
    *pos += 1;
    if c != b'|' {
        return Ok(c);
    }
    let x = *text.get(*pos).ok_or_else(|| BasicError::new(ErrorKind::BadCommand))?;
    *pos += 1;
    Ok(match x {
        b'!' => {
            if *pos >= text.len() {
                return Err(ErrorKind::BadCommand.into());
            }
            gstrans_char(text, pos)? | 0x80
        }
        b'?' => 0x7F,
        b'|' | b'"' => x,
        0x40..=0x7E => x & 0x1F,
        _ => x,
    })
}

/// Show a key definition the way `*SHOW` does, the reverse of GSTrans
fn show_gstrans(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        if b >= 0x80 {
            out.push_str("|!");
        }
        match b & 0x7F {
            0x7F => out.push_str("|?"),
            c @ 0..=0x1F => {
                out.push('|');
                out.push((c | 0x40) as char);
            }
            b'|' => out.push_str("||"),
            b'"' => out.push_str("|\""),
            c => out.push(c as char),
        }
    }
    out
}

/// Split `FX 5,1` style arguments on commas and spaces
fn numbers(args: &str) -> Result<Vec<i32>> {
    args.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| parse_number(s).ok_or_else(|| BasicError::new(ErrorKind::BadCommand)))
        .collect()
}

/// Decimal, or hexadecimal after `&`
fn parse_number(text: &str) -> Option<i32> {
    match text.strip_prefix('&') {
        Some(hex) => u32::from_str_radix(hex, 16).ok().map(|n| n as i32),
        None => text.parse().ok(),
    }
}

/// Addresses in `*LOAD` and `*SAVE` are hexadecimal
fn parse_address(text: &str) -> Result<usize> {
    let hex = text.strip_prefix('&').unwrap_or(text);
    usize::from_str_radix(hex, 16).map_err(|_| BasicError::new(ErrorKind::BadCommand))
}

/// `On`, `Off` or a number
fn on_off(args: &str) -> Option<bool> {
    match args.trim().to_ascii_uppercase().as_str() {
        "ON" | "1" => Some(true),
        "OFF" | "0" => Some(false),
        _ => None,
    }
}

impl Interpreter {
    /// Act on a `*` command line
    pub(crate) fn oscli(&mut self, command: &[u8]) -> Result<()> {
        let start = command.iter().position(|&c| c != b' ' && c != b'*').unwrap_or(command.len());
        let end = command.iter().rposition(|&c| c != b' ' && c != b'\r').map_or(start, |p| p + 1);
        let line = String::from_utf8_lossy(&command[start..end.max(start)]).into_owned();
        if line.is_empty() || line.starts_with('|') {
            return Ok(());
        }
        if self.config.nostar {
            return self.host_command(&line);
        }
        let split = line
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(line.len());
        let (name, args) = if line.starts_with('.') {
            (".".to_string(), line[1..].trim())
        } else {
            (line[..split].to_ascii_uppercase(), line[split..].trim())
        };
        debug!(command = %name, args, "star command");
        match name.as_str() {
            "CAT" | "." => self.star_cat(args, false),
            "EX" => self.star_cat(args, true),
            "CD" | "CHDIR" | "DIR" => {
                let dir = if args.is_empty() { env::var("HOME").unwrap_or_else(|_| ".".into()) } else { args.to_string() };
                env::set_current_dir(&dir).map_err(|_| BasicError::new(ErrorKind::NotFound).with_str(dir))
            }
            "KEY" => self.star_key(args),
            "SHOW" => self.star_show(args),
            "FX" => {
                let values = numbers(args)?;
                match values[..] {
                    [a] => self.osbyte(a, 0, 0).map(|_| ()),
                    [a, x] => self.osbyte(a, x, 0).map(|_| ()),
                    [a, x, y] => self.osbyte(a, x, y).map(|_| ()),
                    _ => Err(ErrorKind::BadCommand.into()),
                }
            }
            "HELP" => self.screen.write_str(&format!(
                "\r\nBrandy BASIC V/VI interpreter version {}\r\n",
                env!("CARGO_PKG_VERSION")
            )),
            "QUIT" => {
                self.quit = Some(0);
                Err(ErrorKind::Exit.into())
            }
            "LOAD" => self.star_load(args),
            "SAVE" => self.star_save(args),
            "SPOOL" | "SPOOLON" => {
                if args.is_empty() {
                    self.screen.spool_off();
                    Ok(())
                } else {
                    self.screen.spool_to(Path::new(args), name == "SPOOLON")
                }
            }
            "EXEC" => {
                if args.is_empty() {
                    self.keyboard.stop_exec();
                    Ok(())
                } else {
                    let path = self.files.find(args).ok_or_else(|| BasicError::new(ErrorKind::NotFound).with_str(args))?;
                    self.keyboard.exec_file(&path)
                }
            }
            "TV" => Ok(()),
            "SCREENSAVE" => self.screen.save_bmp(Path::new(args)),
            "SCREENLOAD" => self.screen.load_bmp(Path::new(args)),
            "REFRESH" => {
                match args.to_ascii_uppercase().as_str() {
                    "" => self.video.refresh_now(),
                    "ON" => self.video.set_autorefresh(AutoRefresh::On),
                    "OFF" => self.video.set_autorefresh(AutoRefresh::Off),
                    "ONERROR" => self.video.set_autorefresh(AutoRefresh::OnError),
                    _ => return Err(ErrorKind::BadCommand.into()),
                }
                Ok(())
            }
            "FULLSCREEN" => {
                let on = if args.is_empty() { !self.config.fullscreen } else { on_off(args).ok_or(ErrorKind::BadCommand)? };
                self.config.fullscreen = on;
                self.video.request(Request::FullScreen(on))
            }
            "NEWMODE" => {
                let values = numbers(args)?;
                match values[..] {
                    [_, xres, yres, colours, ..] if xres > 0 && yres > 0 && colours > 0 => {
                        self.screen.set_custom_mode(xres as usize, yres as usize, colours as u32)
                    }
                    _ => Err(ErrorKind::BadModeSc.into()),
                }
            }
            "WINTITLE" => self.video.request(Request::Title(args.trim_matches('"').to_string())),
            "VOLUME" => {
                let volume = parse_number(args).ok_or(ErrorKind::BadCommand)?;
                self.sound.set_volume(volume);
                Ok(())
            }
            "VOICES" => {
                let text = self.sound.describe();
                self.screen.write_str(&text)
            }
            "TEMPO" => {
                self.sound.tempo = parse_number(args).ok_or(ErrorKind::BadCommand)?;
                Ok(())
            }
            "SOUND" => {
                self.sound.enabled = on_off(args).ok_or(ErrorKind::BadCommand)?;
                if !self.sound.enabled {
                    self.sound.flush_all();
                }
                Ok(())
            }
            "POINTER" => {
                self.keyboard.mouse_enabled = args.is_empty() || on_off(args).unwrap_or(true);
                Ok(())
            }
            _ => self.host_command(&line),
        }
    }

    /// Run a command in the host shell, showing what it prints
    fn host_command(&mut self, line: &str) -> Result<()> {
        debug!(command = line, "passing command to the host");
        self.screen.flush();
        let output = if cfg!(target_os = "windows") {
            Command::new("cmd").args(["/C", line]).output()
        } else {
            Command::new("sh").args(["-c", line]).output()
        }
        .map_err(|e| {
            warn!(error = %e, "cannot start shell");
            BasicError::new(ErrorKind::CmdFail).with_int(-1)
        })?;
        for stream in [&output.stdout, &output.stderr] {
            let mut text = Vec::with_capacity(stream.len());
            for &b in stream.iter() {
                if b == b'\n' {
                    text.push(b'\r');
                }
                text.push(b);
            }
            self.screen.write(&text)?;
        }
        match output.status.code() {
            Some(0) => Ok(()),
            code => Err(BasicError::new(ErrorKind::CmdFail).with_int(code.unwrap_or(-1) as i64)),
        }
    }

    /// `*CAT` lists the names in a directory, `*EX` their sizes as well
    fn star_cat(&mut self, args: &str, sizes: bool) -> Result<()> {
        let dir = if args.is_empty() { "." } else { args };
        let entries = fs::read_dir(dir).map_err(|_| BasicError::new(ErrorKind::NotFound).with_str(dir))?;
        let mut names: Vec<(String, Option<u64>)> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let size = e.metadata().ok().filter(|m| m.is_file()).map(|m| m.len());
                (e.file_name().to_string_lossy().into_owned(), size)
            })
            .collect();
        names.sort();
        let mut text = String::new();
        for (i, (name, size)) in names.iter().enumerate() {
            if sizes {
                let size = size.map_or_else(|| "DIR".to_string(), |s| s.to_string());
                text.push_str(&format!("{:<30}{:>10}\r\n", name, size));
            } else {
                text.push_str(&format!("{:<20}", name));
                if i % 4 == 3 {
                    text.push_str("\r\n");
                }
            }
        }
        if !sizes && names.len() % 4 != 0 {
            text.push_str("\r\n");
        }
        self.screen.write_str(&text)
    }

    /// `*KEY n text`
    fn star_key(&mut self, args: &str) -> Result<()> {
        let digits = args.find(|c: char| !c.is_ascii_digit()).unwrap_or(args.len());
        let key: usize = args[..digits].parse().map_err(|_| BasicError::new(ErrorKind::BadKey))?;
        let text = gstrans(args[digits..].as_bytes())?;
        self.keyboard.set_fkey(key, text)
    }

    fn star_show(&mut self, args: &str) -> Result<()> {
        let only = parse_number(args).map(|n| n as usize);
        let mut text = String::new();
        for key in 0..crate::keyboard::FUNCTION_KEYS {
            if only.is_some_and(|n| n != key) {
                continue;
            }
            let definition = self.keyboard.fkey(key).unwrap_or_default();
            text.push_str(&format!("Key {} : \"{}\"\r\n", key, show_gstrans(definition)));
        }
        self.screen.write_str(&text)
    }

    /// `*LOAD file address`
    fn star_load(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let name = parts.next().ok_or(ErrorKind::BadCommand)?;
        let address = parse_address(parts.next().ok_or(ErrorKind::BadCommand)?)?;
        let (_, data) = self.files.read_file(name)?;
        self.mem.write_bytes(address, &data)
    }

    /// `*SAVE file start end` or `*SAVE file start +length`
    fn star_save(&mut self, args: &str) -> Result<()> {
        let mut parts = args.split_whitespace();
        let name = parts.next().ok_or(ErrorKind::BadCommand)?;
        let start = parse_address(parts.next().ok_or(ErrorKind::BadCommand)?)?;
        let last = parts.next().ok_or(ErrorKind::BadCommand)?;
        let length = match last.strip_prefix('+') {
            Some(len) => parse_address(len)?,
            None => parse_address(last)?.checked_sub(start).ok_or(ErrorKind::BadCommand)?,
        };
        let data = self.mem.slice(start, length)?.to_vec();
        self.files.write_file(name, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn interp() -> Interpreter {
        Interpreter::headless(Config::new()).unwrap()
    }

    #[test]
    fn test_gstrans_controls() {
        assert_eq!(gstrans(b"|A|B|M").unwrap(), vec![1, 2, 13]);
        assert_eq!(gstrans(b"|?||x|\"").unwrap(), b"\x7f|x\"".to_vec());
        assert_eq!(gstrans(b"|!A").unwrap(), vec![0xC1]);
        assert_eq!(gstrans(b"|!|A").unwrap(), vec![0x81]);
    }

    #[test]
    fn test_gstrans_key_definition() {
        // |! applies to the translated character that follows
        assert_eq!(gstrans(b"|A|B|!|@hello").unwrap(), b"\x01\x02\x80hello".to_vec());
    }

    #[test]
    fn test_gstrans_quotes() {
        assert_eq!(gstrans(b"  \"two words\" ignored").unwrap(), b"two words".to_vec());
        assert_eq!(gstrans(b"\"open").unwrap_err().kind, ErrorKind::QuoteMiss);
        assert_eq!(gstrans(b"bar|").unwrap_err().kind, ErrorKind::BadCommand);
    }

    #[test]
    fn test_show_reverses_gstrans() {
        let text = b"|A|!B||x|?";
        assert_eq!(show_gstrans(&gstrans(text).unwrap()), "|A|!B||x|?");
    }

    #[test]
    fn test_star_key_and_show() {
        let mut i = interp();
        i.execute_line(b"*KEY 1 |A|Bhi").unwrap();
        assert_eq!(i.keyboard.fkey(1), Some(&b"\x01\x02hi"[..]));
        i.execute_line(b"*SHOW 1").unwrap();
        assert_eq!(i.output(), "Key 1 : \"|A|Bhi\"\r\n");
        assert_eq!(i.execute_line(b"*KEY 99 x").unwrap_err().kind, ErrorKind::BadKey);
    }

    #[test]
    fn test_star_comment_and_fx() {
        let mut i = interp();
        i.execute_line(b"*| nothing happens").unwrap();
        i.execute_line(b"*FX 220,1").unwrap();
        assert_eq!(i.keyboard.escape_char, 1);
        assert_eq!(i.output(), "");
    }

    #[test]
    fn test_star_save_and_load_memory() {
        let mut i = interp();
        let path = std::env::temp_dir().join(format!("brandy_mem_{}.bin", std::process::id()));
        let name = path.display().to_string();
        i.execute_line(b"DIM A% 8:DIM B% 8:$A%=\"ABC\"").unwrap();
        i.execute_line(format!("OSCLI \"SAVE {} \"+STR$~A%+\" +4\"", name).as_bytes()).unwrap();
        i.execute_line(format!("OSCLI \"LOAD {} \"+STR$~B%", name).as_bytes()).unwrap();
        i.execute_line(b"PRINT $B%").unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(i.output(), "ABC\r\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_host_command_output() {
        let mut i = interp();
        i.execute_line(b"*echo hello").unwrap();
        assert_eq!(i.output(), "hello\r\n");
        let err = i.execute_line(b"*exit 3").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CmdFail);
    }

    #[test]
    fn test_star_quit() {
        let mut i = interp();
        assert_eq!(i.execute_line(b"*QUIT").unwrap_err().kind, ErrorKind::Exit);
        assert_eq!(i.quit_code(), Some(0));
    }
}
