//! The `SYS` gateway
//!
//! Services are named as on RISC OS (`OS_Byte`, `Brandy_Hex64`) or given
//! by number. Setting [`XBIT`] in the number, or starting the name with
//! `X`, turns errors into a set V flag instead.

use std::env;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{BasicError, ErrorKind, Result};
use crate::executor::Interpreter;
use crate::variables::Value;
use crate::vdu::mode_info;

/// Return errors in the flags rather than raising them
pub const XBIT: i32 = 0x2_0000;
/// `OS_WriteI` plus a character code writes that character
const OS_WRITEI: i32 = 0x100;
const REGISTERS: usize = 10;

const FLAG_V: i32 = 1;
const FLAG_C: i32 = 2;

const OS_WRITEC: i32 = 0x00;
const OS_WRITE0: i32 = 0x02;
const OS_NEWLINE: i32 = 0x03;
const OS_READC: i32 = 0x04;
const OS_CLI: i32 = 0x05;
const OS_BYTE: i32 = 0x06;
const OS_WORD: i32 = 0x07;
const OS_GETENV: i32 = 0x10;
const OS_EXIT: i32 = 0x11;
const OS_MOUSE: i32 = 0x1C;
const OS_READPALETTE: i32 = 0x2F;
const OS_READVDUVARIABLES: i32 = 0x31;
const OS_READPOINT: i32 = 0x32;
const OS_READMODEVARIABLE: i32 = 0x35;
const OS_READMONOTONICTIME: i32 = 0x42;
const OS_PLOT: i32 = 0x45;
const OS_WRITEN: i32 = 0x46;
const OS_SCREENMODE: i32 = 0x65;

const BRANDY_VERSION: i32 = 0x14_0000;
const BRANDY_SWAP16PALETTE: i32 = 0x14_0001;
const BRANDY_GETWINSIZE: i32 = 0x14_0002;
const BRANDY_INTUSESFLOAT: i32 = 0x14_0003;
const BRANDY_LEGACYINTMATHS: i32 = 0x14_0004;
const BRANDY_HEX64: i32 = 0x14_0005;
const BRANDY_DELISBS: i32 = 0x14_0006;
const BRANDY_PSEUDOVARSUNSIGNED: i32 = 0x14_0007;
const BRANDY_TEKENABLED: i32 = 0x14_0008;
const BRANDY_USLEEP: i32 = 0x14_0009;
const BRANDY_BITSHIFT64: i32 = 0x14_000A;
const BRANDY_PLATFORM: i32 = 0x14_000B;
const BRANDY_MOUSEEVENTEXPIRE: i32 = 0x14_000C;
const BRANDY_SETFAILOVERMODE: i32 = 0x14_000D;
const BRANDY_CASCADEDIFTWEAK: i32 = 0x14_000E;

const SERVICES: &[(&str, i32)] = &[
    ("OS_WriteC", OS_WRITEC),
    ("OS_Write0", OS_WRITE0),
    ("OS_NewLine", OS_NEWLINE),
    ("OS_ReadC", OS_READC),
    ("OS_CLI", OS_CLI),
    ("OS_Byte", OS_BYTE),
    ("OS_Word", OS_WORD),
    ("OS_GetEnv", OS_GETENV),
    ("OS_Exit", OS_EXIT),
    ("OS_Mouse", OS_MOUSE),
    ("OS_ReadPalette", OS_READPALETTE),
    ("OS_ReadVduVariables", OS_READVDUVARIABLES),
    ("OS_ReadPoint", OS_READPOINT),
    ("OS_ReadModeVariable", OS_READMODEVARIABLE),
    ("OS_ReadMonotonicTime", OS_READMONOTONICTIME),
    ("OS_Plot", OS_PLOT),
    ("OS_WriteN", OS_WRITEN),
    ("OS_ScreenMode", OS_SCREENMODE),
    ("Brandy_Version", BRANDY_VERSION),
    ("Brandy_Swap16Palette", BRANDY_SWAP16PALETTE),
    ("Brandy_GetWinSize", BRANDY_GETWINSIZE),
    ("Brandy_INTusesFloat", BRANDY_INTUSESFLOAT),
    ("Brandy_LegacyIntMaths", BRANDY_LEGACYINTMATHS),
    ("Brandy_Hex64", BRANDY_HEX64),
    ("Brandy_DELisBS", BRANDY_DELISBS),
    ("Brandy_PseudovarsUnsigned", BRANDY_PSEUDOVARSUNSIGNED),
    ("Brandy_TekEnabled", BRANDY_TEKENABLED),
    ("Brandy_uSleep", BRANDY_USLEEP),
    ("Brandy_BitShift64", BRANDY_BITSHIFT64),
    ("Brandy_Platform", BRANDY_PLATFORM),
    ("Brandy_MouseEventExpire", BRANDY_MOUSEEVENTEXPIRE),
    ("Brandy_SetFailoverMode", BRANDY_SETFAILOVERMODE),
    ("Brandy_CascadedIFtweak", BRANDY_CASCADEDIFTWEAK),
];

/// Number of a named service, with [`XBIT`] set for an `X` prefix
pub fn service_number(name: &str) -> Option<i32> {
    let find = |name: &str| {
        if let Some(c) = name.strip_prefix("OS_WriteI+") {
            return c.parse::<i32>().ok().filter(|c| (0..256).contains(c)).map(|c| OS_WRITEI + c);
        }
        SERVICES.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|&(_, number)| number)
    };
    find(name).or_else(|| {
        let plain = name.strip_prefix('X').or_else(|| name.strip_prefix('x'))?;
        find(plain).map(|n| n | XBIT)
    })
}

/// Name of a service number, as `OS_SWINumberToString` would give it
pub fn service_name(number: i32) -> Option<String> {
    let prefix = if number & XBIT != 0 { "X" } else { "" };
    let plain = number & !XBIT;
    if (OS_WRITEI..OS_WRITEI + 256).contains(&plain) {
        return Some(format!("{}OS_WriteI+{}", prefix, plain - OS_WRITEI));
    }
    SERVICES.iter().find(|&&(_, n)| n == plain).map(|(name, _)| format!("{}{}", prefix, name))
}

/// Integer in register `n`; strings and missing registers read as 0
fn int(regs: &[Value], n: usize) -> Result<i32> {
    match regs.get(n) {
        Some(v) if !v.is_string() => v.to_i32_wrapping(),
        _ => Ok(0),
    }
}

impl Interpreter {
    /// Text in a register: either a string, or the address of one ending
    /// in CR or NUL
    fn reg_string(&self, regs: &[Value], n: usize) -> Result<Vec<u8>> {
        match regs.get(n) {
            Some(Value::Str(s)) => Ok(s.clone()),
            Some(v) => {
                let address = v.to_i64()? as usize;
                let mut text = self.mem.peek_string(address, crate::variables::MAXSTRING)?;
                if let Some(nul) = text.iter().position(|&b| b == 0) {
                    text.truncate(nul);
                }
                Ok(text)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Call a service. Returns the output registers and the processor
    /// flags.
    pub(crate) fn sys(&mut self, service: &Value, inputs: Vec<Value>) -> Result<(Vec<Value>, i32)> {
        if inputs.len() > REGISTERS {
            return Err(ErrorKind::SysCount.into());
        }
        let number = match service {
            Value::Str(name) => {
                let name = String::from_utf8_lossy(name).into_owned();
                service_number(&name).ok_or_else(|| BasicError::new(ErrorKind::SwiNameUnknown).with_str(name))?
            }
            other => other.to_i32_wrapping()?,
        };
        let mut regs = inputs;
        regs.resize(REGISTERS, Value::Int(0));
        debug!(service = ?service_name(number), number, "SYS");
        match self.call_service(number & !XBIT, &mut regs) {
            Ok(flags) => Ok((regs, flags)),
            Err(err) if number & XBIT != 0 && !matches!(err.kind, ErrorKind::Exit | ErrorKind::Escape) => {
                regs[0] = Value::Int(err.number());
                Ok((regs, FLAG_V))
            }
            Err(err) => Err(err),
        }
    }

    fn call_service(&mut self, number: i32, regs: &mut [Value]) -> Result<i32> {
        let mut flags = 0;
        match number {
            OS_WRITEC => self.screen.write(&[int(regs, 0)? as u8])?,
            OS_WRITE0 => {
                let text = self.reg_string(regs, 0)?;
                self.screen.write(&text)?;
            }
            OS_NEWLINE => self.screen.write(b"\r\n")?,
            OS_READC => match self.keyboard.get(None) {
                Ok(key) => regs[0] = Value::Int(key.map_or(-1, i32::from)),
                Err(err) if err.kind == ErrorKind::Escape => {
                    regs[0] = Value::Int(27);
                    flags |= FLAG_C;
                }
                Err(err) => return Err(err),
            },
            OS_CLI => {
                let command = self.reg_string(regs, 0)?;
                self.oscli(&command)?;
            }
            OS_BYTE => {
                let (x, y) = self.osbyte(int(regs, 0)?, int(regs, 1)?, int(regs, 2)?)?;
                regs[1] = Value::Int(x);
                regs[2] = Value::Int(y);
            }
            OS_WORD => self.osword(int(regs, 0)?, int(regs, 1)? as u32 as usize)?,
            OS_GETENV => {
                let mut command = String::from("brandy");
                for arg in &self.args {
                    command.push(' ');
                    command.push_str(arg);
                }
                regs[0] = Value::Str(command.into_bytes());
                regs[1] = Value::Int(self.mem.himem() as i32);
                regs[2] = Value::Int(0);
            }
            OS_EXIT => {
                self.quit = Some(int(regs, 2)?);
                return Err(ErrorKind::Exit.into());
            }
            OS_MOUSE => {
                let event = self.keyboard.read_mouse(self.video.monotonic());
                regs[0] = Value::Int(event.x);
                regs[1] = Value::Int(event.y);
                regs[2] = Value::Int(event.buttons);
                regs[3] = Value::Int(event.time as i32);
            }
            OS_READPALETTE => {
                let (r, g, b) = self.screen.palette_entry(int(regs, 0)? as u32);
                let entry = (b as i32) << 24 | (g as i32) << 16 | (r as i32) << 8;
                regs[2] = Value::Int(entry);
                regs[3] = Value::Int(entry);
            }
            OS_READVDUVARIABLES => {
                let (input, output) = (int(regs, 0)? as u32 as usize, int(regs, 1)? as u32 as usize);
                let mut n = 0;
                loop {
                    let variable = self.mem.peek_int(input + n * 4)?;
                    if variable == -1 {
                        break;
                    }
                    let value = self.screen.vdu_variable(variable as u32).unwrap_or(0);
                    self.mem.poke_int(output + n * 4, value)?;
                    n += 1;
                }
            }
            OS_READPOINT => {
                let (colour, tint) = self.screen.point(int(regs, 0)?, int(regs, 1)?);
                regs[2] = Value::Int(colour.max(0));
                regs[3] = Value::Int(tint);
                regs[4] = Value::Int(if colour < 0 { -1 } else { 0 });
            }
            OS_READMODEVARIABLE => {
                let (mode, variable) = (int(regs, 0)?, int(regs, 1)? as u32);
                let value = if mode < 0 || mode as u32 == self.screen.mode().number {
                    self.screen.vdu_variable(variable).filter(|_| variable < 128)
                } else {
                    mode_info(mode as u32).and_then(|m| m.variable(variable))
                };
                match value {
                    Some(value) => regs[2] = Value::Int(value),
                    None => flags |= FLAG_C,
                }
            }
            OS_READMONOTONICTIME => regs[0] = Value::Int(self.video.monotonic() as i32),
            OS_PLOT => self.screen.plot(int(regs, 0)? as u8, int(regs, 1)?, int(regs, 2)?)?,
            OS_WRITEN => {
                let text = self.reg_string(regs, 0)?;
                let count = (int(regs, 1)?.max(0) as usize).min(text.len());
                self.screen.write(&text[..count])?;
            }
            OS_SCREENMODE => match int(regs, 0)? {
                0 => self.screen.set_mode(int(regs, 1)? as u32)?,
                1 => regs[1] = Value::Int(self.screen.mode().number as i32),
                _ => return Err(BasicError::new(ErrorKind::SwiNumUnknown).with_int(number as i64)),
            },
            BRANDY_VERSION => {
                let part = |s: &str| s.parse::<i32>().unwrap_or(0);
                regs[0] = Value::Int(part(env!("CARGO_PKG_VERSION_MAJOR")));
                regs[1] = Value::Int(part(env!("CARGO_PKG_VERSION_MINOR")));
                regs[2] = Value::Int(part(env!("CARGO_PKG_VERSION_PATCH")));
                regs[3] = Value::Str(env::consts::OS.as_bytes().to_vec());
                regs[4] = Value::Int(if self.video.is_headless() { 0 } else { 1 });
            }
            BRANDY_SWAP16PALETTE => {}
            BRANDY_GETWINSIZE => {
                let mode = self.screen.mode();
                let (width, height) = (mode.xres as i32, mode.yres as i32);
                regs[0] = Value::Int(width);
                regs[1] = Value::Int(height);
                regs[2] = Value::Int(self.screen.vdu_variable(4).unwrap_or(1));
                regs[3] = Value::Int(self.screen.vdu_variable(5).unwrap_or(1));
            }
            BRANDY_INTUSESFLOAT => self.set_flag(regs, |c| &mut c.int_uses_float)?,
            BRANDY_LEGACYINTMATHS => self.set_flag(regs, |c| &mut c.legacy_int_maths)?,
            BRANDY_HEX64 => self.set_flag(regs, |c| &mut c.hex64)?,
            BRANDY_DELISBS => {
                self.set_flag(regs, |c| &mut c.del_is_bs)?;
                self.keyboard.del_is_bs = self.config.del_is_bs;
            }
            BRANDY_PSEUDOVARSUNSIGNED => self.set_flag(regs, |c| &mut c.pseudovars_unsigned)?,
            BRANDY_TEKENABLED => self.set_flag(regs, |c| &mut c.tek_enabled)?,
            BRANDY_BITSHIFT64 => self.set_flag(regs, |c| &mut c.bitshift64)?,
            BRANDY_CASCADEDIFTWEAK => self.set_flag(regs, |c| &mut c.cascaded_if_tweak)?,
            BRANDY_USLEEP => thread::sleep(Duration::from_micros(int(regs, 0)?.max(0) as u64)),
            BRANDY_PLATFORM => {
                regs[0] = Value::Str(env::consts::OS.as_bytes().to_vec());
                regs[1] = Value::Int(i32::from(cfg!(target_pointer_width = "64")));
            }
            BRANDY_MOUSEEVENTEXPIRE => {
                let expire = int(regs, 0)?.max(0) as u32;
                self.config.mouse_event_expire = expire;
                self.keyboard.mouse_expire = expire;
            }
            BRANDY_SETFAILOVERMODE => self.config.failover_mode = int(regs, 0)?,
            _ => return Err(BasicError::new(ErrorKind::SwiNumUnknown).with_int(number as i64)),
        }
        Ok(flags)
    }

    /// Set a configuration flag from R0, returning the old setting in R0
    fn set_flag(&mut self, regs: &mut [Value], flag: impl Fn(&mut crate::config::Config) -> &mut bool) -> Result<()> {
        let new = int(regs, 0)? != 0;
        let setting = flag(&mut self.config);
        let old = std::mem::replace(setting, new);
        regs[0] = Value::Int(i32::from(old));
        debug!(enabled = new, "configuration flag changed");
        Ok(())
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
    fn test_service_names() {
        assert_eq!(service_number("OS_Byte"), Some(OS_BYTE));
        assert_eq!(service_number("os_byte"), Some(OS_BYTE));
        assert_eq!(service_number("XOS_Byte"), Some(OS_BYTE | XBIT));
        assert_eq!(service_number("OS_WriteI+65"), Some(0x141));
        assert_eq!(service_number("OS_Nothing"), None);
        assert_eq!(service_name(BRANDY_HEX64 | XBIT).as_deref(), Some("XBrandy_Hex64"));
    }

    #[test]
    fn test_flags_and_registers() {
        let mut i = interp();
        let (regs, flags) = i.sys(&Value::Str(b"Brandy_Hex64".to_vec()), vec![Value::Int(1)]).unwrap();
        assert!(i.config.hex64);
        assert_eq!(regs[0], Value::Int(0));
        assert_eq!(flags, 0);
    }

    #[test]
    fn test_unknown_service() {
        let mut i = interp();
        let err = i.sys(&Value::Str(b"Nope".to_vec()), vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SwiNameUnknown);
        let err = i.sys(&Value::Int(0x7777), vec![]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SwiNumUnknown);
        let (_, flags) = i.sys(&Value::Int(0x7777 | XBIT), vec![]).unwrap();
        assert_eq!(flags, FLAG_V);
        let too_many = vec![Value::Int(0); 11];
        assert_eq!(i.sys(&Value::Int(OS_WRITEC), too_many).unwrap_err().kind, ErrorKind::SysCount);
    }

    #[test]
    fn test_sys_statement() {
        let mut i = interp();
        i.set_args(vec!["one".into(), "two".into()]);
        i.execute_line(b"SYS \"OS_GetEnv\" TO A$:PRINT A$").unwrap();
        assert_eq!(i.output(), "brandy one two\r\n");
        i.execute_line(b"SYS \"OS_WriteC\",65:SYS \"OS_Write0\",\"BC\":SYS \"OS_NewLine\"").unwrap();
        assert_eq!(i.output(), "ABC\r\n");
        i.execute_line(b"SYS \"OS_ReadModeVariable\",-1,11 TO ,,X%;F%").unwrap();
        let width = i.screen.mode().xres as i32;
        assert_eq!(i.vars.get_value("X%").unwrap(), Value::Int(width - 1));
        assert_eq!(i.vars.get_value("F%").unwrap(), Value::Int(0));
        i.execute_line(b"SYS \"XOS_Bogus\" TO ;F%").unwrap_err();
    }
}
