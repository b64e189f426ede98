//! Error handling for the interpreter
//!
//! Every BASIC error is one of a closed set of kinds. Each kind carries the
//! error number reported by `ERR`, a severity that decides how the executor
//! reacts to it, and a message template. Templates may contain `{n}` (integer
//! parameter) and `{s}` (string parameter) placeholders.

use std::fmt;

/// Result type for interpreter operations
pub type Result<T> = std::result::Result<T, BasicError>;

/// How an error is propagated
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Printed, execution continues
    Info,
    /// Printed (optionally with line number), execution continues
    Warning,
    /// Trappable by `ON ERROR`
    NonFatal,
    /// Bypasses any handler
    Fatal,
}

macro_rules! error_kinds {
    ($($name:ident = ($num:expr, $sev:ident, $msg:expr)),* $(,)?) => {
        /// The closed set of interpreter errors
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorKind {
            $($name),*
        }

        impl ErrorKind {
            /// BBC error number as returned by `ERR`
            pub fn number(self) -> i32 {
                match self {
                    $(ErrorKind::$name => $num),*
                }
            }

            /// Default severity, before `-strict`/`-ignore` adjustments
            pub fn severity(self) -> Severity {
                match self {
                    $(ErrorKind::$name => Severity::$sev),*
                }
            }

            /// Message template
            pub fn template(self) -> &'static str {
                match self {
                    $(ErrorKind::$name => $msg),*
                }
            }

            /// Every kind, in declaration order
            pub fn all() -> &'static [ErrorKind] {
                &[$(ErrorKind::$name),*]
            }
        }
    };
}

error_kinds! {
    // Tokenizer and listing warnings
    WarnBadToken = (0, Warning, "Unrecognised token value &{n} found"),
    WarnBadHex = (0, Warning, "Hexadecimal number is badly formed"),
    WarnBadBin = (0, Warning, "Binary number is badly formed"),
    WarnExpOflo = (0, Warning, "Exponent is too large"),
    WarnQuoteMiss = (0, Warning, "Closing '\"' missing from string"),
    WarnParNest = (0, Warning, "Unbalanced parentheses in statement"),
    WarnBadDec = (0, Warning, "Decimal number is badly formed"),
    WarnLineNo = (0, Warning, "Line number {n} is out of range"),
    WarnNewSize = (0, Info, "Workspace size changed to {n} bytes"),
    WarnEndianness = (0, Warning, "Floating point format not recognised, assuming little-endian"),
    WarnRenumber = (0, Warning, "Line {n} referenced but not present"),
    WarnBadLomem = (0, Warning, "LOMEM value is out of range"),
    WarnBadHimem = (0, Warning, "HIMEM value is out of range"),
    WarnBadPage = (0, Warning, "PAGE value is out of range"),
    WarnMultiNext = (0, Warning, "Loop variable in NEXT does not match FOR"),
    WarnPrecision = (0, Warning, "Precision lost converting floating point value"),
    WarnFunnyName = (0, Warning, "Program name '{s}' has been adjusted"),
    // Fatal conditions
    Broken = (0, Fatal, "Program is corrupt or has been overwritten"),
    Crash = (0, Fatal, "Internal error: {s}"),
    BadProg = (0, Fatal, "Program is corrupt, {s}"),
    OpStack = (0, Fatal, "Expression is too complex to evaluate"),
    Exit = (0, Fatal, "Program terminated"),
    // Generic syntax
    Syntax = (16, NonFatal, "Syntax error"),
    Silly = (0, NonFatal, "Silly!"),
    Unsupported = (0, NonFatal, "Unsupported BASIC V feature found"),
    UnsupState = (0, NonFatal, "Statement type not supported by this version of the interpreter"),
    NoGraphics = (0, NonFatal, "Graphics are not available in this screen mode"),
    NoVduCmds = (0, NonFatal, "VDU commands cannot be used here"),
    StateLen = (0, NonFatal, "Statement is too long"),
    LineNo = (0, NonFatal, "Line number outside range 0 to 65279"),
    LineMiss = (41, NonFatal, "Cannot find line {n}"),
    VarMiss = (26, NonFatal, "Unknown variable '{s}'"),
    ArrayMiss = (14, NonFatal, "Cannot find array '{s})'"),
    FnMiss = (29, NonFatal, "Cannot find function 'FN{s}'"),
    ProcMiss = (29, NonFatal, "Cannot find procedure 'PROC{s}'"),
    TooMany = (31, NonFatal, "Too many parameters found in call to PROC{s}"),
    NotEnuff = (31, NonFatal, "Not enough parameters supplied in call to PROC{s}"),
    FnTooMany = (31, NonFatal, "Too many parameters found in call to FN{s}"),
    FnNotEnuff = (31, NonFatal, "Not enough parameters supplied in call to FN{s}"),
    BadRet = (31, NonFatal, "RETURN parameter must be a variable"),
    BadDim = (10, NonFatal, "Not enough room to create array '{s})'"),
    BadByteDim = (10, NonFatal, "Not enough room to create a byte array called '{s}'"),
    NegDim = (10, NonFatal, "Array dimension must be a positive number"),
    DimCount = (10, NonFatal, "Array has too many dimensions"),
    DuplDim = (10, NonFatal, "Array '{s})' has already been created"),
    BadIndex = (15, NonFatal, "Array index value {n} is out of range"),
    IndexCo = (15, NonFatal, "Number of array indexes is wrong"),
    DimRange = (15, NonFatal, "Dimension number is out of range"),
    NoDims = (14, NonFatal, "Array '{s})' has not been created"),
    Address = (0, NonFatal, "Memory access to &{n} is outside the address range of the BASIC workspace"),
    NotInProc = (13, NonFatal, "Not in a procedure"),
    NotInFn = (7, NonFatal, "Not in a function"),
    BadVarProcName = (29, NonFatal, "Bad name for procedure or function"),
    NotProc = (13, NonFatal, "Function called as a procedure"),
    NotFn = (7, NonFatal, "Procedure called as a function"),
    LocalMiss = (12, NonFatal, "LOCAL found outside a procedure or function"),
    PrivateMiss = (12, NonFatal, "PRIVATE found outside a procedure or function"),
    // Punctuation
    EqMiss = (4, NonFatal, "Mistake, '=' missing"),
    CoMiss = (5, NonFatal, "Missing ','"),
    LpMiss = (27, NonFatal, "Missing '('"),
    RpMiss = (27, NonFatal, "Missing ')'"),
    QuoteMiss = (9, NonFatal, "Missing '\"'"),
    HashMiss = (45, NonFatal, "Missing '#'"),
    EndifMiss = (49, NonFatal, "Cannot find matching 'ENDIF'"),
    EndwhileMiss = (46, NonFatal, "Cannot find matching 'ENDWHILE'"),
    EndcaseMiss = (47, NonFatal, "Cannot find 'ENDCASE'"),
    OfMiss = (48, NonFatal, "'OF' missing from CASE statement"),
    ToMiss = (36, NonFatal, "'TO' missing from FOR statement"),
    NextMiss = (32, NonFatal, "Cannot find matching 'NEXT'"),
    UntilMiss = (43, NonFatal, "Cannot find matching 'UNTIL'"),
    BadExpr = (16, NonFatal, "Syntax error in expression"),
    BadListo = (0, NonFatal, "LISTO option value is out of range"),
    // Types
    TypeNum = (6, NonFatal, "Type mismatch: number wanted"),
    TypeStr = (6, NonFatal, "Type mismatch: string wanted"),
    TypeArray = (6, NonFatal, "Type mismatch: array wanted"),
    NotNumArray = (6, NonFatal, "Type mismatch: numeric array wanted"),
    NotStrArray = (6, NonFatal, "Type mismatch: string array wanted"),
    MatArray = (6, NonFatal, "Arrays do not have conformant shapes for matrix multiplication"),
    NoSwap = (6, NonFatal, "Variables in SWAP must be of the same type"),
    BadComp = (6, NonFatal, "Cannot compare a number and a string"),
    BadArith = (6, NonFatal, "Cannot perform arithmetic on arrays of different shapes"),
    VarArray = (6, NonFatal, "Array is not allowed here"),
    NotWhole = (6, NonFatal, "Whole array operation on array with differing dimensions"),
    // Control flow
    Return = (38, NonFatal, "RETURN encountered outside a subroutine"),
    NotFor = (32, NonFatal, "Not in a 'FOR' loop"),
    NotRepeat = (43, NonFatal, "Not in a 'REPEAT' loop"),
    NotWhile = (46, NonFatal, "Not in a 'WHILE' loop"),
    ForVar = (34, NonFatal, "FOR loop control variable must be numeric"),
    ForStep = (0, NonFatal, "FOR loop STEP must not be zero"),
    NoGosub = (38, NonFatal, "No GOSUB"),
    OnRange = (40, NonFatal, "ON index value {n} is out of range"),
    OnSyntax = (39, NonFatal, "ON syntax"),
    Data = (42, NonFatal, "Out of data"),
    NoRepeat = (43, NonFatal, "'UNTIL' found without matching 'REPEAT'"),
    NoWhile = (46, NonFatal, "'ENDWHILE' found without matching 'WHILE'"),
    NoCase = (47, NonFatal, "'WHEN' or 'OTHERWISE' found outside a CASE statement"),
    WhenCount = (47, NonFatal, "Too many 'WHEN' clauses in CASE statement"),
    BadOtherwise = (47, NonFatal, "'OTHERWISE' must be the last clause of a CASE statement"),
    NoEndproc = (13, NonFatal, "'ENDPROC' found outside a procedure"),
    FnReturn = (7, NonFatal, "Function return '=' found outside a function"),
    DefMiss = (0, NonFatal, "'DEF' found in the body of the program"),
    NotExit = (0, NonFatal, "EXIT must be followed by FOR, REPEAT or WHILE"),
    Stop = (0, Fatal, "Stopped at line {n}"),
    Escape = (17, NonFatal, "Escape"),
    Running = (0, NonFatal, "Command cannot be used in a running program"),
    NoCont = (0, NonFatal, "Cannot continue"),
    // Arithmetic
    DivZero = (18, NonFatal, "Division by zero"),
    NegRoot = (21, NonFatal, "Square root of a negative number"),
    LogRange = (22, NonFatal, "Logarithm of zero or negative number"),
    Range = (20, NonFatal, "Number is out of range"),
    Arithmetic = (20, NonFatal, "Floating point exception"),
    AcsRange = (23, NonFatal, "Argument of ACS or ASN is out of range"),
    ExpRange = (24, NonFatal, "Exponent is out of range"),
    Precision = (20, NonFatal, "Number too big"),
    // Memory
    NoRoom = (0, NonFatal, "Out of memory"),
    StackFull = (0, NonFatal, "Stack overflow: the BASIC stack has collided with the heap"),
    TooDeep = (0, NonFatal, "Procedure or function calls are nested too deeply"),
    StringLen = (19, NonFatal, "String is too long"),
    BadString = (8, NonFatal, "String index is out of range"),
    NoMemory = (0, Fatal, "Cannot allocate memory for the BASIC workspace"),
    // Files
    OpenIn = (214, NonFatal, "Cannot find file '{s}'"),
    OpenWrite = (192, NonFatal, "Cannot open file '{s}' for output"),
    CantRead = (189, NonFatal, "Cannot read file '{s}'"),
    CantWrite = (193, NonFatal, "Cannot write to file"),
    HitEof = (223, NonFatal, "Attempted to read beyond end of file"),
    ReadFail = (189, NonFatal, "Read from file failed"),
    NotFound = (214, NonFatal, "File '{s}' not found"),
    EditFail = (0, NonFatal, "Editing of program failed: {s}"),
    BadHandle = (222, NonFatal, "Channel number is invalid"),
    MaxHandle = (192, NonFatal, "Maximum number of files are already open"),
    SetPtrFail = (0, NonFatal, "Cannot set file pointer"),
    NotOpenRead = (0, NonFatal, "File has not been opened for input"),
    NotOpenWrite = (0, NonFatal, "File has not been opened for output"),
    BadFormat = (0, NonFatal, "Data in file is not in the format expected"),
    NoLib = (0, NonFatal, "Cannot find library '{s}'"),
    LibLoad = (0, NonFatal, "Cannot load library '{s}'"),
    BadProgFile = (0, NonFatal, "File '{s}' is not a BASIC program"),
    // Screen and OS
    BadMode = (25, NonFatal, "Screen mode {n} is not available"),
    BadModeSc = (25, NonFatal, "Screen mode descriptor is invalid"),
    BadMouse = (50, NonFatal, "Bad MOUSE variable"),
    BadPlot = (0, NonFatal, "PLOT code {n} is not supported"),
    NoMouse = (0, NonFatal, "No mouse is available"),
    SwiNameUnknown = (486, NonFatal, "SWI name '{s}' not known"),
    SwiNumUnknown = (486, NonFatal, "SWI &{n} not known"),
    SysCount = (51, NonFatal, "Too many parameters in SYS statement"),
    BadCommand = (254, NonFatal, "Bad command"),
    CmdFail = (0, NonFatal, "OS command failed with exit code {n}"),
    StarDisabled = (0, NonFatal, "Star commands are disabled"),
    BadKey = (251, NonFatal, "Bad key number"),
    KeyStrLen = (0, NonFatal, "Function key string is too long"),
    BadOsByte = (0, NonFatal, "OSBYTE {n} is not supported"),
    BadOsWord = (0, NonFatal, "OSWORD {n} is not supported"),
    BadSound = (0, NonFatal, "Sound channel or parameter is out of range"),
    BadTint = (0, NonFatal, "TINT value is out of range"),
    BadWindow = (0, NonFatal, "Window coordinates are out of range"),
    BadDirectory = (214, NonFatal, "Cannot change directory to '{s}'"),
    // Editor
    Renumber = (0, NonFatal, "RENUMBER failed: line number would exceed 65279"),
    BadLineRange = (0, NonFatal, "Line number range is invalid"),
    NoProgram = (0, NonFatal, "There is no program"),
    NoOld = (0, NonFatal, "Cannot recover program"),
    BadAuto = (0, NonFatal, "AUTO step is invalid"),
    // Signals and traps
    AddrExcept = (0, NonFatal, "Address exception: illegal memory access in host code"),
    BadCall = (30, NonFatal, "Bad call"),
    BadSysFlags = (0, NonFatal, "Bad SYS flags variable"),
    // User errors raised by ERROR
    User = (0, NonFatal, "{s}"),
    // Raised by ERROR EXT; bypasses BASIC handlers
    UserExt = (0, Fatal, "{s}"),
    // Informational
    InfoBye = (0, Info, "Bye"),
    InfoEndLine = (0, Info, "Program ended at line {n}"),
    // END executed inside a function; unwinds every run loop
    EndRun = (0, Info, ""),
}

/// A BASIC error with its parameters and location
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", self.message())]
pub struct BasicError {
    pub kind: ErrorKind,
    /// Overrides the kind's number (`ERROR n, ...`)
    pub number: Option<i32>,
    pub int_param: Option<i64>,
    pub str_param: Option<String>,
    /// Line where the error was raised, if known
    pub line: Option<u16>,
    /// Innermost PROC/FN active when the error was raised
    pub proc_name: Option<String>,
    /// Library the failing line belongs to
    pub library: Option<String>,
}

impl BasicError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            number: None,
            int_param: None,
            str_param: None,
            line: None,
            proc_name: None,
            library: None,
        }
    }

    /// A user error raised with `ERROR n, "message"`
    pub fn user(number: i32, message: impl Into<String>) -> Self {
        Self {
            number: Some(number),
            ..Self::new(ErrorKind::User).with_str(message)
        }
    }

    pub fn with_int(mut self, value: i64) -> Self {
        self.int_param = Some(value);
        self
    }

    pub fn with_str(mut self, value: impl Into<String>) -> Self {
        self.str_param = Some(value.into());
        self
    }

    pub fn at_line(mut self, line: u16) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    pub fn in_proc(mut self, name: impl Into<String>) -> Self {
        if self.proc_name.is_none() {
            self.proc_name = Some(name.into());
        }
        self
    }

    pub fn in_library(mut self, name: impl Into<String>) -> Self {
        if self.library.is_none() {
            self.library = Some(name.into());
        }
        self
    }

    /// Error number as seen by `ERR`
    pub fn number(&self) -> i32 {
        self.number.unwrap_or_else(|| self.kind.number())
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Severity after the `-strict`/`-ignore` policy is applied.
    /// `None` means the error is suppressed entirely.
    pub fn effective_severity(&self, strict: bool, ignore: bool) -> Option<Severity> {
        let sev = self.severity();
        if sev == Severity::Warning {
            if strict && self.kind.is_behaviour_warning() {
                return Some(Severity::NonFatal);
            }
            if ignore && !self.kind.is_behaviour_warning() {
                return None;
            }
        }
        Some(sev)
    }

    /// Message text with parameters substituted (`REPORT$`)
    pub fn message(&self) -> String {
        let template = self.kind.template();
        let mut out = String::with_capacity(template.len() + 16);
        let mut rest = template;
        while let Some(pos) = rest.find('{') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{n}") {
                let n = self.int_param.unwrap_or(0);
                if template[..template.len() - rest.len() + pos].ends_with('&') {
                    out.push_str(&format!("{:X}", n));
                } else {
                    out.push_str(&n.to_string());
                }
                rest = &tail[3..];
            } else if tail.starts_with("{s}") {
                out.push_str(self.str_param.as_deref().unwrap_or(""));
                rest = &tail[3..];
            } else {
                out.push('{');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }

    /// Full report as printed when the error is not trapped
    pub fn report(&self, running: bool) -> String {
        let mut text = self.message();
        match self.line {
            Some(line) if running => {
                text.push_str(&format!(" at line {}", line));
                if let Some(name) = &self.proc_name {
                    text.push_str(&format!(" in {}", name));
                }
                if let Some(lib) = &self.library {
                    text.push_str(&format!(" in library {}", lib));
                }
            }
            Some(line) => text = format!("[Line {}] {}", line, text),
            None => {}
        }
        text
    }
}

impl ErrorKind {
    /// Warnings about program behaviour that `-strict` turns into errors
    pub fn is_behaviour_warning(self) -> bool {
        matches!(
            self,
            ErrorKind::WarnBadHex | ErrorKind::WarnBadBin | ErrorKind::WarnQuoteMiss
        )
    }
}

impl From<ErrorKind> for BasicError {
    fn from(kind: ErrorKind) -> Self {
        BasicError::new(kind)
    }
}

impl From<std::io::Error> for BasicError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                BasicError::new(ErrorKind::NotFound).with_str(err.to_string())
            }
            std::io::ErrorKind::UnexpectedEof => BasicError::new(ErrorKind::HitEof),
            _ => BasicError::new(ErrorKind::CantWrite).with_str(err.to_string()),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::NonFatal => "error",
            Severity::Fatal => "fatal error",
        };
        write!(f, "{}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_substitution() {
        let err = BasicError::new(ErrorKind::LineMiss).with_int(120);
        assert_eq!(err.message(), "Cannot find line 120");
        let err = BasicError::new(ErrorKind::ProcMiss).with_str("foo");
        assert_eq!(err.message(), "Cannot find procedure 'PROCfoo'");
    }

    #[test]
    fn test_hex_parameter() {
        let err = BasicError::new(ErrorKind::Address).with_int(0x1234);
        assert!(err.message().contains("&1234"));
    }

    #[test]
    fn test_user_error_number() {
        let err = BasicError::user(100, "Custom");
        assert_eq!(err.number(), 100);
        assert_eq!(err.message(), "Custom");
        assert_eq!(err.to_string(), "Custom");
    }

    #[test]
    fn test_report_formats() {
        let err = BasicError::new(ErrorKind::DivZero).at_line(20).in_proc("PROCx");
        assert_eq!(err.report(true), "Division by zero at line 20 in PROCx");
        assert_eq!(err.report(false), "[Line 20] Division by zero");
        assert_eq!(BasicError::new(ErrorKind::Escape).report(true), "Escape");
    }

    #[test]
    fn test_strict_promotes_behaviour_warnings() {
        let hex = BasicError::new(ErrorKind::WarnBadHex);
        assert_eq!(hex.effective_severity(true, false), Some(Severity::NonFatal));
        assert_eq!(hex.effective_severity(false, false), Some(Severity::Warning));
        let expo = BasicError::new(ErrorKind::WarnExpOflo);
        assert_eq!(expo.effective_severity(true, false), Some(Severity::Warning));
        assert_eq!(expo.effective_severity(false, true), None);
    }

    #[test]
    fn test_taxonomy_is_large_and_closed() {
        assert!(ErrorKind::all().len() >= 160);
        assert_eq!(ErrorKind::Escape.number(), 17);
        assert_eq!(ErrorKind::DivZero.number(), 18);
        assert_eq!(ErrorKind::Exit.severity(), Severity::Fatal);
    }
}
