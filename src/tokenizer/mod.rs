//! Tokenizer for BBC BASIC source code
//!
//! Converts BBC BASIC source lines into the internal tokenised form used by
//! the program store and the executor, and back again for `LIST`.
//!
//! A tokenised line payload is a byte string in which keywords are single
//! bytes in the range `0x7F..=0xFF` (or a prefix byte `0xC6`/`0xC7`/`0xC8`
//! followed by a second byte), line number references are `0x8D` followed by
//! three encoded bytes, and everything else (names, numbers, strings,
//! punctuation) is kept as ASCII text.

use crate::error::{BasicError, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Longest statement accepted by the tokenizer
pub const MAX_STATEMENT: usize = 1024;
/// Highest usable line number
pub const MAX_LINENO: u32 = 65279;
/// Statement terminator at the end of every tokenised line
pub const LINE_END: u8 = 0x0D;

// Single byte tokens used directly by the executor
pub const TOKEN_OTHERWISE: u8 = 0x7F;
pub const TOKEN_AND: u8 = 0x80;
pub const TOKEN_DIV: u8 = 0x81;
pub const TOKEN_EOR: u8 = 0x82;
pub const TOKEN_MOD: u8 = 0x83;
pub const TOKEN_OR: u8 = 0x84;
pub const TOKEN_ERROR: u8 = 0x85;
pub const TOKEN_LINE: u8 = 0x86;
pub const TOKEN_OFF: u8 = 0x87;
pub const TOKEN_STEP: u8 = 0x88;
pub const TOKEN_SPC: u8 = 0x89;
pub const TOKEN_TAB: u8 = 0x8A;
pub const TOKEN_ELSE: u8 = 0x8B;
pub const TOKEN_THEN: u8 = 0x8C;
pub const TOKEN_LINENUM: u8 = 0x8D;
pub const TOKEN_OPENIN: u8 = 0x8E;
pub const TOKEN_PTR: u8 = 0x8F;
pub const TOKEN_PAGE: u8 = 0x90;
pub const TOKEN_TIME: u8 = 0x91;
pub const TOKEN_LOMEM: u8 = 0x92;
pub const TOKEN_HIMEM: u8 = 0x93;
pub const TOKEN_ABS: u8 = 0x94;
pub const TOKEN_ACS: u8 = 0x95;
pub const TOKEN_ADVAL: u8 = 0x96;
pub const TOKEN_ASC: u8 = 0x97;
pub const TOKEN_ASN: u8 = 0x98;
pub const TOKEN_ATN: u8 = 0x99;
pub const TOKEN_BGET: u8 = 0x9A;
pub const TOKEN_COS: u8 = 0x9B;
pub const TOKEN_COUNT: u8 = 0x9C;
pub const TOKEN_DEG: u8 = 0x9D;
pub const TOKEN_ERL: u8 = 0x9E;
pub const TOKEN_ERR: u8 = 0x9F;
pub const TOKEN_EVAL: u8 = 0xA0;
pub const TOKEN_EXP: u8 = 0xA1;
pub const TOKEN_EXT: u8 = 0xA2;
pub const TOKEN_FALSE: u8 = 0xA3;
pub const TOKEN_FN: u8 = 0xA4;
pub const TOKEN_GET: u8 = 0xA5;
pub const TOKEN_INKEY: u8 = 0xA6;
pub const TOKEN_INSTR: u8 = 0xA7;
pub const TOKEN_INT: u8 = 0xA8;
pub const TOKEN_LEN: u8 = 0xA9;
pub const TOKEN_LN: u8 = 0xAA;
pub const TOKEN_LOG: u8 = 0xAB;
pub const TOKEN_NOT: u8 = 0xAC;
pub const TOKEN_OPENUP: u8 = 0xAD;
pub const TOKEN_OPENOUT: u8 = 0xAE;
pub const TOKEN_PI: u8 = 0xAF;
pub const TOKEN_POINTFN: u8 = 0xB0;
pub const TOKEN_POS: u8 = 0xB1;
pub const TOKEN_RAD: u8 = 0xB2;
pub const TOKEN_RND: u8 = 0xB3;
pub const TOKEN_SGN: u8 = 0xB4;
pub const TOKEN_SIN: u8 = 0xB5;
pub const TOKEN_SQR: u8 = 0xB6;
pub const TOKEN_TAN: u8 = 0xB7;
pub const TOKEN_TO: u8 = 0xB8;
pub const TOKEN_TRUE: u8 = 0xB9;
pub const TOKEN_USR: u8 = 0xBA;
pub const TOKEN_VAL: u8 = 0xBB;
pub const TOKEN_VPOS: u8 = 0xBC;
pub const TOKEN_CHRS: u8 = 0xBD;
pub const TOKEN_GETS: u8 = 0xBE;
pub const TOKEN_INKEYS: u8 = 0xBF;
pub const TOKEN_LEFTS: u8 = 0xC0;
pub const TOKEN_MIDS: u8 = 0xC1;
pub const TOKEN_RIGHTS: u8 = 0xC2;
pub const TOKEN_STRS: u8 = 0xC3;
pub const TOKEN_STRINGS: u8 = 0xC4;
pub const TOKEN_EOF: u8 = 0xC5;
pub const TOKEN_XFUNCTION: u8 = 0xC6;
pub const TOKEN_XCOMMAND: u8 = 0xC7;
pub const TOKEN_XSTATEMENT: u8 = 0xC8;
pub const TOKEN_WHEN: u8 = 0xC9;
pub const TOKEN_OF: u8 = 0xCA;
pub const TOKEN_ENDCASE: u8 = 0xCB;
pub const TOKEN_XELSE: u8 = 0xCC;
pub const TOKEN_ENDIF: u8 = 0xCD;
pub const TOKEN_ENDWHILE: u8 = 0xCE;
pub const TOKEN_PTR_STMT: u8 = 0xCF;
pub const TOKEN_PAGE_STMT: u8 = 0xD0;
pub const TOKEN_TIME_STMT: u8 = 0xD1;
pub const TOKEN_LOMEM_STMT: u8 = 0xD2;
pub const TOKEN_HIMEM_STMT: u8 = 0xD3;
pub const TOKEN_SOUND: u8 = 0xD4;
pub const TOKEN_BPUT: u8 = 0xD5;
pub const TOKEN_CALL: u8 = 0xD6;
pub const TOKEN_CHAIN: u8 = 0xD7;
pub const TOKEN_CLEAR: u8 = 0xD8;
pub const TOKEN_CLOSE: u8 = 0xD9;
pub const TOKEN_CLG: u8 = 0xDA;
pub const TOKEN_CLS: u8 = 0xDB;
pub const TOKEN_DATA: u8 = 0xDC;
pub const TOKEN_DEF: u8 = 0xDD;
pub const TOKEN_DIM: u8 = 0xDE;
pub const TOKEN_DRAW: u8 = 0xDF;
pub const TOKEN_END: u8 = 0xE0;
pub const TOKEN_ENDPROC: u8 = 0xE1;
pub const TOKEN_ENVELOPE: u8 = 0xE2;
pub const TOKEN_FOR: u8 = 0xE3;
pub const TOKEN_GOSUB: u8 = 0xE4;
pub const TOKEN_GOTO: u8 = 0xE5;
pub const TOKEN_GCOL: u8 = 0xE6;
pub const TOKEN_IF: u8 = 0xE7;
pub const TOKEN_INPUT: u8 = 0xE8;
pub const TOKEN_LET: u8 = 0xE9;
pub const TOKEN_LOCAL: u8 = 0xEA;
pub const TOKEN_MODE: u8 = 0xEB;
pub const TOKEN_MOVE: u8 = 0xEC;
pub const TOKEN_NEXT: u8 = 0xED;
pub const TOKEN_ON: u8 = 0xEE;
pub const TOKEN_VDU: u8 = 0xEF;
pub const TOKEN_PLOT: u8 = 0xF0;
pub const TOKEN_PRINT: u8 = 0xF1;
pub const TOKEN_PROC: u8 = 0xF2;
pub const TOKEN_READ: u8 = 0xF3;
pub const TOKEN_REM: u8 = 0xF4;
pub const TOKEN_REPEAT: u8 = 0xF5;
pub const TOKEN_REPORT: u8 = 0xF6;
pub const TOKEN_RESTORE: u8 = 0xF7;
pub const TOKEN_RETURN: u8 = 0xF8;
pub const TOKEN_RUN: u8 = 0xF9;
pub const TOKEN_STOP: u8 = 0xFA;
pub const TOKEN_COLOUR: u8 = 0xFB;
pub const TOKEN_TRACE: u8 = 0xFC;
pub const TOKEN_UNTIL: u8 = 0xFD;
pub const TOKEN_WIDTH: u8 = 0xFE;
pub const TOKEN_OSCLI: u8 = 0xFF;

// Second byte of 0xC6 (function) tokens
pub const XFN_SUM: u8 = 0x8E;
pub const XFN_BEAT: u8 = 0x8F;

// Second byte of 0xC7 (command) tokens
pub const XCMD_APPEND: u8 = 0x8E;
pub const XCMD_AUTO: u8 = 0x8F;
pub const XCMD_CRUNCH: u8 = 0x90;
pub const XCMD_DELETE: u8 = 0x91;
pub const XCMD_EDIT: u8 = 0x92;
pub const XCMD_HELP: u8 = 0x93;
pub const XCMD_LIST: u8 = 0x94;
pub const XCMD_LOAD: u8 = 0x95;
pub const XCMD_LVAR: u8 = 0x96;
pub const XCMD_NEW: u8 = 0x97;
pub const XCMD_OLD: u8 = 0x98;
pub const XCMD_RENUMBER: u8 = 0x99;
pub const XCMD_SAVE: u8 = 0x9A;
pub const XCMD_TEXTLOAD: u8 = 0x9B;
pub const XCMD_TEXTSAVE: u8 = 0x9C;
pub const XCMD_TWIN: u8 = 0x9D;
pub const XCMD_TWINO: u8 = 0x9E;
pub const XCMD_INSTALL: u8 = 0x9F;

// Second byte of 0xC8 (statement) tokens
pub const XSTMT_CASE: u8 = 0x8E;
pub const XSTMT_CIRCLE: u8 = 0x8F;
pub const XSTMT_FILL: u8 = 0x90;
pub const XSTMT_ORIGIN: u8 = 0x91;
pub const XSTMT_POINT: u8 = 0x92;
pub const XSTMT_RECTANGLE: u8 = 0x93;
pub const XSTMT_SWAP: u8 = 0x94;
pub const XSTMT_WHILE: u8 = 0x95;
pub const XSTMT_WAIT: u8 = 0x96;
pub const XSTMT_MOUSE: u8 = 0x97;
pub const XSTMT_QUIT: u8 = 0x98;
pub const XSTMT_SYS: u8 = 0x99;
pub const XSTMT_INSTALL: u8 = 0x9A;
pub const XSTMT_LIBRARY: u8 = 0x9B;
pub const XSTMT_TINT: u8 = 0x9C;
pub const XSTMT_ELLIPSE: u8 = 0x9D;
pub const XSTMT_BEATS: u8 = 0x9E;
pub const XSTMT_TEMPO: u8 = 0x9F;
pub const XSTMT_VOICES: u8 = 0xA0;
pub const XSTMT_VOICE: u8 = 0xA1;
pub const XSTMT_STEREO: u8 = 0xA2;
pub const XSTMT_OVERLAY: u8 = 0xA3;
pub const XSTMT_EXIT: u8 = 0xA4;
pub const XSTMT_PRIVATE: u8 = 0xA5;

/// Keyword is not tokenised when followed by a letter, digit or underscore
const CONDITIONAL: u8 = 1;
/// Numbers following the keyword are line numbers
const LINE_FOLLOWS: u8 = 2;
/// A new statement starts after the keyword
const STATEMENT_FOLLOWS: u8 = 4;
/// A PROC/FN name follows and must not be tokenised
const NAME_FOLLOWS: u8 = 8;
/// The rest of the line is copied verbatim
const REST_VERBATIM: u8 = 16;
/// Keyword has a different token at the start of a statement
const PSEUDO_VARIABLE: u8 = 32;

/// A keyword and how it is tokenised
struct Keyword {
    text: &'static str,
    prefix: Option<u8>,
    token: u8,
    flags: u8,
}

const fn kw(text: &'static str, token: u8, flags: u8) -> Keyword {
    Keyword { text, prefix: None, token, flags }
}

const fn xkw(text: &'static str, prefix: u8, token: u8, flags: u8) -> Keyword {
    Keyword { text, prefix: Some(prefix), token, flags }
}

// BBC BASIC keyword to token mappings
const MAIN_KEYWORDS: &[Keyword] = &[
    kw("OTHERWISE", 0x7F, STATEMENT_FOLLOWS | CONDITIONAL),
    // Operators and logical functions (0x80-0x8C)
    kw("AND", 0x80, 0),
    kw("DIV", 0x81, 0),
    kw("EOR", 0x82, 0),
    kw("MOD", 0x83, 0),
    kw("OR", 0x84, 0),
    kw("ERROR", 0x85, 0),
    kw("LINE", 0x86, 0),
    kw("OFF", 0x87, CONDITIONAL),
    kw("STEP", 0x88, 0),
    kw("SPC", 0x89, 0),
    kw("TAB(", 0x8A, 0),
    kw("ELSE", 0x8B, LINE_FOLLOWS | STATEMENT_FOLLOWS),
    kw("THEN", 0x8C, LINE_FOLLOWS | STATEMENT_FOLLOWS),
    // Functions and system variables (0x8E-0xC5)
    kw("OPENIN", 0x8E, 0),
    kw("PTR", 0x8F, CONDITIONAL | PSEUDO_VARIABLE),
    kw("PAGE", 0x90, CONDITIONAL | PSEUDO_VARIABLE),
    kw("TIME", 0x91, CONDITIONAL | PSEUDO_VARIABLE),
    kw("LOMEM", 0x92, CONDITIONAL | PSEUDO_VARIABLE),
    kw("HIMEM", 0x93, CONDITIONAL | PSEUDO_VARIABLE),
    kw("ABS", 0x94, 0),
    kw("ACS", 0x95, 0),
    kw("ADVAL", 0x96, 0),
    kw("ASC", 0x97, 0),
    kw("ASN", 0x98, 0),
    kw("ATN", 0x99, 0),
    kw("BGET", 0x9A, CONDITIONAL),
    kw("COS", 0x9B, 0),
    kw("COUNT", 0x9C, CONDITIONAL),
    kw("DEG", 0x9D, 0),
    kw("ERL", 0x9E, CONDITIONAL),
    kw("ERR", 0x9F, CONDITIONAL),
    kw("EVAL", 0xA0, 0),
    kw("EXP", 0xA1, 0),
    kw("EXT", 0xA2, CONDITIONAL),
    kw("FALSE", 0xA3, CONDITIONAL),
    kw("FN", 0xA4, NAME_FOLLOWS),
    kw("GET", 0xA5, 0),
    kw("INKEY", 0xA6, 0),
    kw("INSTR(", 0xA7, 0),
    kw("INT", 0xA8, 0),
    kw("LEN", 0xA9, 0),
    kw("LN", 0xAA, 0),
    kw("LOG", 0xAB, 0),
    kw("NOT", 0xAC, 0),
    kw("OPENUP", 0xAD, 0),
    kw("OPENOUT", 0xAE, 0),
    kw("PI", 0xAF, CONDITIONAL),
    kw("POINT(", 0xB0, 0),
    kw("POS", 0xB1, CONDITIONAL),
    kw("RAD", 0xB2, 0),
    kw("RND", 0xB3, CONDITIONAL),
    kw("SGN", 0xB4, 0),
    kw("SIN", 0xB5, 0),
    kw("SQR", 0xB6, 0),
    kw("TAN", 0xB7, 0),
    kw("TO", 0xB8, 0),
    kw("TRUE", 0xB9, CONDITIONAL),
    kw("USR", 0xBA, 0),
    kw("VAL", 0xBB, 0),
    kw("VPOS", 0xBC, CONDITIONAL),
    kw("CHR$", 0xBD, 0),
    kw("GET$", 0xBE, 0),
    kw("INKEY$", 0xBF, 0),
    kw("LEFT$(", 0xC0, 0),
    kw("MID$(", 0xC1, 0),
    kw("RIGHT$(", 0xC2, 0),
    kw("STR$", 0xC3, 0),
    kw("STRING$(", 0xC4, 0),
    kw("EOF", 0xC5, CONDITIONAL),
    // Structure words (0xC9-0xCE)
    kw("WHEN", 0xC9, 0),
    kw("OF", 0xCA, 0),
    kw("ENDCASE", 0xCB, CONDITIONAL),
    kw("ENDIF", 0xCD, CONDITIONAL),
    kw("ENDWHILE", 0xCE, CONDITIONAL),
    // Commands and statements (0xD4-0xFF)
    kw("SOUND", 0xD4, 0),
    kw("BPUT", 0xD5, CONDITIONAL),
    kw("CALL", 0xD6, 0),
    kw("CHAIN", 0xD7, 0),
    kw("CLEAR", 0xD8, CONDITIONAL),
    kw("CLOSE", 0xD9, CONDITIONAL),
    kw("CLG", 0xDA, CONDITIONAL),
    kw("CLS", 0xDB, CONDITIONAL),
    kw("DATA", 0xDC, REST_VERBATIM),
    kw("DEF", 0xDD, 0),
    kw("DIM", 0xDE, 0),
    kw("DRAW", 0xDF, 0),
    kw("END", 0xE0, CONDITIONAL),
    kw("ENDPROC", 0xE1, CONDITIONAL),
    kw("ENVELOPE", 0xE2, 0),
    kw("FOR", 0xE3, 0),
    kw("GOSUB", 0xE4, LINE_FOLLOWS),
    kw("GOTO", 0xE5, LINE_FOLLOWS),
    kw("GCOL", 0xE6, 0),
    kw("IF", 0xE7, 0),
    kw("INPUT", 0xE8, 0),
    kw("LET", 0xE9, 0),
    kw("LOCAL", 0xEA, 0),
    kw("MODE", 0xEB, 0),
    kw("MOVE", 0xEC, 0),
    kw("NEXT", 0xED, 0),
    kw("ON", 0xEE, 0),
    kw("VDU", 0xEF, 0),
    kw("PLOT", 0xF0, 0),
    kw("PRINT", 0xF1, 0),
    kw("PROC", 0xF2, NAME_FOLLOWS),
    kw("READ", 0xF3, 0),
    kw("REM", 0xF4, REST_VERBATIM),
    kw("REPEAT", 0xF5, STATEMENT_FOLLOWS),
    kw("REPORT", 0xF6, CONDITIONAL),
    kw("RESTORE", 0xF7, LINE_FOLLOWS),
    kw("RETURN", 0xF8, CONDITIONAL),
    kw("RUN", 0xF9, CONDITIONAL),
    kw("STOP", 0xFA, CONDITIONAL),
    kw("COLOUR", 0xFB, 0),
    kw("TRACE", 0xFC, LINE_FOLLOWS),
    kw("UNTIL", 0xFD, 0),
    kw("WIDTH", 0xFE, 0),
    kw("OSCLI", 0xFF, 0),
];

// Extended functions (0xC6 prefix)
const EXTENDED_FUNCTIONS: &[Keyword] = &[
    xkw("SUM", 0xC6, 0x8E, 0),
    xkw("BEAT", 0xC6, 0x8F, CONDITIONAL),
];

// Extended commands (0xC7 prefix)
const EXTENDED_COMMANDS: &[Keyword] = &[
    xkw("APPEND", 0xC7, 0x8E, 0),
    xkw("AUTO", 0xC7, 0x8F, 0),
    xkw("CRUNCH", 0xC7, 0x90, 0),
    xkw("DELETE", 0xC7, 0x91, 0),
    xkw("EDIT", 0xC7, 0x92, 0),
    xkw("HELP", 0xC7, 0x93, CONDITIONAL),
    xkw("LIST", 0xC7, 0x94, 0),
    xkw("LOAD", 0xC7, 0x95, 0),
    xkw("LVAR", 0xC7, 0x96, CONDITIONAL),
    xkw("NEW", 0xC7, 0x97, CONDITIONAL),
    xkw("OLD", 0xC7, 0x98, CONDITIONAL),
    xkw("RENUMBER", 0xC7, 0x99, 0),
    xkw("SAVE", 0xC7, 0x9A, 0),
    xkw("TEXTLOAD", 0xC7, 0x9B, 0),
    xkw("TEXTSAVE", 0xC7, 0x9C, 0),
    xkw("TWIN", 0xC7, 0x9D, CONDITIONAL),
    xkw("TWINO", 0xC7, 0x9E, CONDITIONAL),
];

// Extended statements (0xC8 prefix)
const EXTENDED_STATEMENTS: &[Keyword] = &[
    xkw("CASE", 0xC8, 0x8E, 0),
    xkw("CIRCLE", 0xC8, 0x8F, 0),
    xkw("FILL", 0xC8, 0x90, 0),
    xkw("ORIGIN", 0xC8, 0x91, 0),
    xkw("POINT", 0xC8, 0x92, 0),
    xkw("RECTANGLE", 0xC8, 0x93, 0),
    xkw("SWAP", 0xC8, 0x94, 0),
    xkw("WHILE", 0xC8, 0x95, 0),
    xkw("WAIT", 0xC8, 0x96, 0),
    xkw("MOUSE", 0xC8, 0x97, 0),
    xkw("QUIT", 0xC8, 0x98, 0),
    xkw("SYS", 0xC8, 0x99, 0),
    xkw("INSTALL", 0xC8, 0x9A, 0),
    xkw("LIBRARY", 0xC8, 0x9B, 0),
    xkw("TINT", 0xC8, 0x9C, 0),
    xkw("ELLIPSE", 0xC8, 0x9D, 0),
    xkw("BEATS", 0xC8, 0x9E, 0),
    xkw("TEMPO", 0xC8, 0x9F, 0),
    xkw("VOICES", 0xC8, 0xA0, 0),
    xkw("VOICE", 0xC8, 0xA1, 0),
    xkw("STEREO", 0xC8, 0xA2, 0),
    xkw("OVERLAY", 0xC8, 0xA3, 0),
    xkw("EXIT", 0xC8, 0xA4, 0),
    xkw("PRIVATE", 0xC8, 0xA5, 0),
];

/// Statement forms of the pseudo-variables
fn statement_form(token: u8) -> u8 {
    match token {
        TOKEN_PTR => TOKEN_PTR_STMT,
        TOKEN_PAGE => TOKEN_PAGE_STMT,
        TOKEN_TIME => TOKEN_TIME_STMT,
        TOKEN_LOMEM => TOKEN_LOMEM_STMT,
        TOKEN_HIMEM => TOKEN_HIMEM_STMT,
        other => other,
    }
}

/// Keywords grouped by first letter, longest first
fn keyword_index() -> &'static HashMap<u8, Vec<&'static Keyword>> {
    static INDEX: OnceLock<HashMap<u8, Vec<&'static Keyword>>> = OnceLock::new();
    INDEX.get_or_init(|| {
        let mut index: HashMap<u8, Vec<&'static Keyword>> = HashMap::new();
        for keyword in MAIN_KEYWORDS
            .iter()
            .chain(EXTENDED_FUNCTIONS)
            .chain(EXTENDED_COMMANDS)
            .chain(EXTENDED_STATEMENTS)
        {
            index.entry(keyword.text.as_bytes()[0]).or_default().push(keyword);
        }
        for list in index.values_mut() {
            list.sort_by(|a, b| b.text.len().cmp(&a.text.len()));
        }
        index
    })
}

/// Text of a single byte token
pub fn keyword_text(token: u8) -> Option<&'static str> {
    match token {
        TOKEN_XELSE => Some("ELSE"),
        TOKEN_PTR_STMT => Some("PTR"),
        TOKEN_PAGE_STMT => Some("PAGE"),
        TOKEN_TIME_STMT => Some("TIME"),
        TOKEN_LOMEM_STMT => Some("LOMEM"),
        TOKEN_HIMEM_STMT => Some("HIMEM"),
        _ => MAIN_KEYWORDS.iter().find(|k| k.token == token).map(|k| k.text),
    }
}

/// Text of a two byte token
pub fn extended_keyword_text(prefix: u8, token: u8) -> Option<&'static str> {
    let table = match prefix {
        TOKEN_XFUNCTION => EXTENDED_FUNCTIONS,
        TOKEN_XCOMMAND => EXTENDED_COMMANDS,
        TOKEN_XSTATEMENT => EXTENDED_STATEMENTS,
        _ => return None,
    };
    table.iter().find(|k| k.token == token).map(|k| k.text)
}

/// Encode a line number as the three bytes following `TOKEN_LINENUM`.
/// None of the bytes can be mistaken for a token or the line terminator.
pub fn encode_line_number(line: u16) -> [u8; 3] {
    let lo = (line & 0xFF) as u8;
    let hi = (line >> 8) as u8;
    [
        (((lo & 0xC0) >> 2) | ((hi & 0xC0) >> 4)) ^ 0x54,
        (lo & 0x3F) | 0x40,
        (hi & 0x3F) | 0x40,
    ]
}

/// Decode the three bytes following `TOKEN_LINENUM`
pub fn decode_line_number(bytes: &[u8]) -> u16 {
    let b0 = bytes[0] ^ 0x54;
    let lo = ((b0 << 2) & 0xC0) | (bytes[1] & 0x3F);
    let hi = ((b0 << 4) & 0xC0) | (bytes[2] & 0x3F);
    (hi as u16) << 8 | lo as u16
}

/// Represents a single token in a tokenised line
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Single-byte keyword tokens (0x7F-0xFF)
    Keyword(u8),
    /// Extended tokens with prefix bytes (0xC6, 0xC7, 0xC8)
    ExtendedKeyword(u8, u8),
    /// Line number reference (0x8D prefix + 3 bytes)
    LineNumber(u16),
    /// String literal, without the surrounding quotes
    String(Vec<u8>),
    /// Any other byte (names, digits, punctuation, REM text)
    Char(u8),
}

/// A complete tokenised line with line number and payload
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedLine {
    pub line_number: Option<u16>,
    /// Payload bytes, without header or terminator
    pub tokens: Vec<u8>,
    /// Non-fatal problems noticed while tokenising
    pub warnings: Vec<BasicError>,
}

impl TokenizedLine {
    /// Create a new tokenized line
    pub fn new(line_number: Option<u16>, tokens: Vec<u8>) -> Self {
        Self { line_number, tokens, warnings: Vec::new() }
    }

    /// Create an empty tokenized line
    pub fn empty() -> Self {
        Self::new(None, Vec::new())
    }

    /// Iterate over the decoded tokens of the payload
    pub fn iter(&self) -> TokenIter<'_> {
        TokenIter::new(&self.tokens)
    }
}

/// Options controlling tokenisation
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizeOptions {
    /// Lines must start with a line number (loading a program file)
    pub require_line_number: bool,
    /// Hex constants may be up to 64 bits wide
    pub hex64: bool,
}

/// Tokenize a BBC BASIC source line
pub fn tokenize(source_line: &str) -> Result<TokenizedLine> {
    tokenize_with(source_line.as_bytes(), TokenizeOptions::default())
}

/// Tokenize a source line with explicit options
pub fn tokenize_with(source: &[u8], options: TokenizeOptions) -> Result<TokenizedLine> {
    let source = trim_line_end(source);
    let mut pos = source.iter().take_while(|&&c| c == b' ' || c == b'\t').count();
    let mut line_number = None;
    if pos < source.len() && source[pos].is_ascii_digit() {
        let start = pos;
        while pos < source.len() && source[pos].is_ascii_digit() {
            pos += 1;
        }
        let text = std::str::from_utf8(&source[start..pos]).unwrap_or("0");
        let value: u64 = text.parse().unwrap_or(u64::MAX);
        if value > MAX_LINENO as u64 {
            return Err(ErrorKind::LineNo.into());
        }
        line_number = Some(value as u16);
    } else if options.require_line_number {
        return Err(ErrorKind::LineNo.into());
    }
    let mut tokenizer = Tokenizer::new(&source[pos..], options);
    tokenizer.run()?;
    Ok(TokenizedLine {
        line_number,
        tokens: tokenizer.out,
        warnings: tokenizer.warnings,
    })
}

fn trim_line_end(source: &[u8]) -> &[u8] {
    let mut end = source.len();
    while end > 0 && matches!(source[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &source[..end]
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'`'
}

struct Tokenizer<'a> {
    src: &'a [u8],
    pos: usize,
    out: Vec<u8>,
    warnings: Vec<BasicError>,
    options: TokenizeOptions,
    statement_start: bool,
    line_mode: bool,
    statement_len: usize,
    paren_depth: i32,
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a [u8], options: TokenizeOptions) -> Self {
        Self {
            src,
            pos: 0,
            out: Vec::with_capacity(src.len()),
            warnings: Vec::new(),
            options,
            statement_start: true,
            line_mode: false,
            statement_len: 0,
            paren_depth: 0,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn emit(&mut self, byte: u8) -> Result<()> {
        self.out.push(byte);
        self.statement_len += 1;
        if self.statement_len > MAX_STATEMENT {
            return Err(ErrorKind::StateLen.into());
        }
        Ok(())
    }

    fn emit_all(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.emit(b)?;
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while let Some(c) = self.peek(0) {
            if self.line_mode {
                if c.is_ascii_digit() {
                    self.line_reference()?;
                    continue;
                }
                if c != b' ' && c != b',' {
                    self.line_mode = false;
                }
            }
            match c {
                b'"' => {
                    self.string()?;
                    self.statement_start = false;
                }
                b':' => {
                    self.pos += 1;
                    self.emit(c)?;
                    self.check_parens();
                    self.statement_start = true;
                    self.statement_len = 0;
                }
                b' ' | b'\t' => {
                    self.pos += 1;
                    self.emit(c)?;
                }
                b'*' if self.statement_start => {
                    self.verbatim()?;
                }
                b'&' if self.at_literal_position() => {
                    self.hex()?;
                    self.statement_start = false;
                }
                b'%' if self.at_literal_position() => {
                    self.binary()?;
                    self.statement_start = false;
                }
                b'0'..=b'9' | b'.' => {
                    self.number()?;
                    self.statement_start = false;
                }
                b'(' | b')' => {
                    self.paren_depth += if c == b'(' { 1 } else { -1 };
                    self.pos += 1;
                    self.emit(c)?;
                    self.statement_start = false;
                }
                _ if c.is_ascii_alphabetic() || c == b'_' || c == b'`' => {
                    self.word()?;
                }
                _ => {
                    self.pos += 1;
                    self.emit(c)?;
                    self.statement_start = false;
                }
            }
        }
        self.check_parens();
        Ok(())
    }

    fn check_parens(&mut self) {
        if self.paren_depth != 0 {
            self.warnings.push(ErrorKind::WarnParNest.into());
        }
        self.paren_depth = 0;
    }

    /// `%` starts a binary literal unless it is a variable type suffix
    fn at_literal_position(&self) -> bool {
        match self.out.last() {
            Some(&prev) => !(is_name_char(prev) || prev == b'%' || prev == b'$'),
            None => true,
        }
    }

    fn line_reference(&mut self) -> Result<()> {
        let src = self.src;
        let start = self.pos;
        while self.peek(0).map_or(false, |c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits = &src[start..self.pos];
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(u64::MAX);
        if value <= MAX_LINENO as u64 {
            self.emit(TOKEN_LINENUM)?;
            self.emit_all(&encode_line_number(value as u16))
        } else {
            self.warnings
                .push(BasicError::new(ErrorKind::WarnLineNo).with_int(value.min(i64::MAX as u64) as i64));
            self.emit_all(digits)
        }
    }

    fn string(&mut self) -> Result<()> {
        self.pos += 1;
        self.emit(b'"')?;
        loop {
            match self.peek(0) {
                None => {
                    self.warnings.push(ErrorKind::WarnQuoteMiss.into());
                    self.emit(b'"')?;
                    return Ok(());
                }
                Some(b'"') => {
                    self.pos += 1;
                    self.emit(b'"')?;
                    if self.peek(0) == Some(b'"') {
                        self.pos += 1;
                        self.emit(b'"')?;
                        continue;
                    }
                    return Ok(());
                }
                Some(c) => {
                    self.pos += 1;
                    self.emit(c)?;
                }
            }
        }
    }

    fn verbatim(&mut self) -> Result<()> {
        while let Some(c) = self.peek(0) {
            self.pos += 1;
            self.emit(c)?;
        }
        Ok(())
    }

    fn hex(&mut self) -> Result<()> {
        self.pos += 1;
        self.emit(b'&')?;
        let mut digits = 0;
        while let Some(c) = self.peek(0) {
            if !c.is_ascii_hexdigit() {
                break;
            }
            self.pos += 1;
            self.emit(c.to_ascii_uppercase())?;
            digits += 1;
        }
        let limit = if self.options.hex64 { 16 } else { 8 };
        if digits == 0 || digits > limit {
            self.warnings.push(ErrorKind::WarnBadHex.into());
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<()> {
        self.pos += 1;
        self.emit(b'%')?;
        let mut digits = 0;
        while let Some(c @ (b'0' | b'1')) = self.peek(0) {
            self.pos += 1;
            self.emit(c)?;
            digits += 1;
        }
        if digits == 0 || digits > 64 {
            self.warnings.push(ErrorKind::WarnBadBin.into());
        }
        Ok(())
    }

    fn number(&mut self) -> Result<()> {
        let src = self.src;
        let start = self.pos;
        let mut seen_point = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' && !seen_point {
                seen_point = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos - start == 1 && src[start] == b'.' {
            // A lone '.' is punctuation (abbreviation or operator)
            return self.emit(b'.');
        }
        if matches!(self.peek(0), Some(b'E')) {
            let sign = matches!(self.peek(1), Some(b'+' | b'-')) as usize;
            if self.peek(1 + sign).map_or(false, |c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                let exp_start = self.pos;
                while self.peek(0).map_or(false, |c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let exp: i32 = std::str::from_utf8(&src[exp_start..self.pos])
                    .ok()
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(i32::MAX);
                if exp > 308 {
                    self.warnings.push(ErrorKind::WarnExpOflo.into());
                }
            }
        }
        let text = &src[start..self.pos];
        if std::str::from_utf8(text)
            .ok()
            .and_then(|t| t.parse::<f64>().ok())
            .is_none()
        {
            self.warnings.push(ErrorKind::WarnBadDec.into());
        }
        self.emit_all(text)
    }

    fn word(&mut self) -> Result<()> {
        if let Some(keyword) = self.match_keyword() {
            self.pos += keyword.text.len();
            let token = if self.statement_start && keyword.flags & PSEUDO_VARIABLE != 0 {
                statement_form(keyword.token)
            } else {
                keyword.token
            };
            let token = if token == TOKEN_ELSE && self.out.iter().all(|&b| b == b' ') {
                TOKEN_XELSE
            } else {
                token
            };
            if let Some(prefix) = keyword.prefix {
                self.emit(prefix)?;
            }
            self.emit(token)?;
            if keyword.text.ends_with('(') {
                self.paren_depth += 1;
            }
            self.statement_start = keyword.flags & STATEMENT_FOLLOWS != 0;
            if keyword.flags & LINE_FOLLOWS != 0 {
                self.line_mode = true;
            }
            if keyword.flags & REST_VERBATIM != 0 {
                return self.verbatim();
            }
            if keyword.flags & NAME_FOLLOWS != 0 {
                self.name()?;
            }
            return Ok(());
        }
        self.statement_start = false;
        self.name()
    }

    /// Copy a variable, PROC or FN name (including any type suffix)
    fn name(&mut self) -> Result<()> {
        while let Some(c) = self.peek(0) {
            if !is_name_char(c) {
                break;
            }
            self.pos += 1;
            self.emit(c)?;
        }
        Ok(())
    }

    fn match_keyword(&self) -> Option<&'static Keyword> {
        let src = self.src;
        let rest = &src[self.pos..];
        let first = rest[0].to_ascii_uppercase();
        let candidates = keyword_index().get(&first)?;
        let upper = rest[0].is_ascii_uppercase();
        for keyword in candidates {
            let text = keyword.text.as_bytes();
            if rest.len() < text.len() {
                continue;
            }
            let candidate = &rest[..text.len()];
            let matched = if upper {
                candidate == text
            } else {
                // Lower case keywords must be whole words
                candidate.eq_ignore_ascii_case(text)
                    && candidate.iter().all(|c| !c.is_ascii_uppercase())
                    && !rest.get(text.len()).map_or(false, |&c| is_name_char(c))
            };
            if !matched {
                continue;
            }
            let next = rest.get(text.len()).copied();
            if keyword.flags & CONDITIONAL != 0 && next.map_or(false, is_name_char) {
                continue;
            }
            return Some(keyword);
        }
        None
    }
}

/// Iterator over the tokens of a payload
pub struct TokenIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    verbatim: bool,
    statement_start: bool,
}

impl<'a> TokenIter<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0, verbatim: false, statement_start: true }
    }
}

impl<'a> Iterator for TokenIter<'a> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        let c = *self.bytes.get(self.pos)?;
        if c == LINE_END {
            return None;
        }
        self.pos += 1;
        if self.verbatim {
            return Some(Token::Char(c));
        }
        match c {
            b'"' => {
                let mut text = Vec::new();
                while let Some(&b) = self.bytes.get(self.pos) {
                    if b == LINE_END {
                        break;
                    }
                    self.pos += 1;
                    if b == b'"' {
                        if self.bytes.get(self.pos) == Some(&b'"') {
                            text.push(b'"');
                            self.pos += 1;
                            continue;
                        }
                        self.statement_start = false;
                        return Some(Token::String(text));
                    }
                    text.push(b);
                }
                self.statement_start = false;
                Some(Token::String(text))
            }
            b'*' if self.statement_start => {
                self.verbatim = true;
                Some(Token::Char(c))
            }
            b':' => {
                self.statement_start = true;
                Some(Token::Char(c))
            }
            b' ' => Some(Token::Char(c)),
            TOKEN_LINENUM if self.pos + 3 <= self.bytes.len() => {
                let line = decode_line_number(&self.bytes[self.pos..self.pos + 3]);
                self.pos += 3;
                Some(Token::LineNumber(line))
            }
            TOKEN_XFUNCTION | TOKEN_XCOMMAND | TOKEN_XSTATEMENT
                if self.pos < self.bytes.len() =>
            {
                let second = self.bytes[self.pos];
                self.pos += 1;
                self.statement_start = false;
                Some(Token::ExtendedKeyword(c, second))
            }
            0x7F..=0xFF => {
                if c == TOKEN_REM || c == TOKEN_DATA {
                    self.verbatim = true;
                }
                self.statement_start = matches!(
                    c,
                    TOKEN_THEN | TOKEN_ELSE | TOKEN_XELSE | TOKEN_REPEAT | TOKEN_OTHERWISE
                );
                Some(Token::Keyword(c))
            }
            _ => {
                self.statement_start = false;
                Some(Token::Char(c))
            }
        }
    }
}

/// Convert tokens back to BBC BASIC source
pub fn detokenize(tokenized_line: &TokenizedLine) -> Result<String> {
    let body = expand(&tokenized_line.tokens, false);
    Ok(match tokenized_line.line_number {
        Some(line) => format!("{}{}", line, body),
        None => body,
    })
}

/// Expand a tokenised payload into source text
pub fn expand(payload: &[u8], lowercase: bool) -> String {
    let mut out = String::with_capacity(payload.len() * 2);
    let keyword = |text: &str, out: &mut String| {
        if lowercase {
            out.push_str(&text.to_ascii_lowercase());
        } else {
            out.push_str(text);
        }
    };
    for token in TokenIter::new(payload) {
        match token {
            Token::Keyword(t) => match keyword_text(t) {
                Some(text) => keyword(text, &mut out),
                None => out.push(t as char),
            },
            Token::ExtendedKeyword(p, t) => match extended_keyword_text(p, t) {
                Some(text) => keyword(text, &mut out),
                None => {
                    out.push(p as char);
                    out.push(t as char);
                }
            },
            Token::LineNumber(n) => out.push_str(&n.to_string()),
            Token::String(s) => {
                out.push('"');
                for &b in &s {
                    if b == b'"' {
                        out.push('"');
                    }
                    out.push(b as char);
                }
                out.push('"');
            }
            Token::Char(c) => out.push(c as char),
        }
    }
    out
}

/// Rewrite every embedded line number reference with `map`.
/// Returns the references `map` could not translate.
pub fn remap_line_numbers(payload: &mut [u8], map: &dyn Fn(u16) -> Option<u16>) -> Vec<u16> {
    let mut missing = Vec::new();
    let mut offsets = Vec::new();
    let mut iter = TokenIter::new(payload);
    let mut last = 0;
    while let Some(token) = iter.next() {
        if let Token::LineNumber(n) = token {
            offsets.push((last, n));
        }
        last = iter.pos;
    }
    for (offset, n) in offsets {
        match map(n) {
            Some(new) => payload[offset + 1..offset + 4].copy_from_slice(&encode_line_number(new)),
            None => missing.push(n),
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(src: &str) -> Vec<u8> {
        tokenize(src).unwrap().tokens
    }

    #[test]
    fn test_tokenized_line_creation() {
        let line = TokenizedLine::new(Some(10), vec![TOKEN_AND]);
        assert_eq!(line.line_number, Some(10));
        assert_eq!(line.tokens.len(), 1);
    }

    #[test]
    fn test_empty_tokenized_line() {
        let line = TokenizedLine::empty();
        assert_eq!(line.line_number, None);
        assert_eq!(line.tokens.len(), 0);
    }

    #[test]
    fn test_keyword_tokens() {
        assert_eq!(payload("PRINT"), vec![TOKEN_PRINT]);
        assert_eq!(payload("PRINTA"), vec![TOKEN_PRINT, b'A']);
        assert_eq!(payload("FORI=1TO10"), {
            let mut v = vec![TOKEN_FOR];
            v.extend_from_slice(b"I=1");
            v.push(TOKEN_TO);
            v.extend_from_slice(b"10");
            v
        });
        assert_eq!(payload("WHILE"), vec![TOKEN_XSTATEMENT, XSTMT_WHILE]);
        assert_eq!(payload("SUM"), vec![TOKEN_XFUNCTION, XFN_SUM]);
    }

    #[test]
    fn test_lowercase_keywords_need_whole_words() {
        assert_eq!(payload("print total"), {
            let mut v = vec![TOKEN_PRINT, b' '];
            v.extend_from_slice(b"total");
            v
        });
    }

    #[test]
    fn test_conditional_keywords() {
        assert_eq!(payload("PAGE"), vec![TOKEN_PAGE_STMT]);
        assert_eq!(payload("A=PAGE"), vec![b'A', b'=', TOKEN_PAGE]);
        assert_eq!(payload("A=PAGES"), b"A=PAGES".to_vec());
    }

    #[test]
    fn test_line_number_references() {
        let p = payload("GOTO 100");
        assert_eq!(p[0], TOKEN_GOTO);
        assert_eq!(p[2], TOKEN_LINENUM);
        assert_eq!(decode_line_number(&p[3..6]), 100);
        let p = payload("ON X GOSUB 10,20");
        assert_eq!(p.iter().filter(|&&b| b == TOKEN_LINENUM).count(), 2);
    }

    #[test]
    fn test_line_number_encoding_all_values() {
        for n in (0..=MAX_LINENO as u16).step_by(7) {
            let enc = encode_line_number(n);
            assert!(enc.iter().all(|&b| b >= 0x40 && b < 0x80 && b != LINE_END));
            assert_eq!(decode_line_number(&enc), n);
        }
    }

    #[test]
    fn test_rem_and_data_are_verbatim() {
        let p = payload("REM PRINT");
        assert_eq!(p, {
            let mut v = vec![TOKEN_REM];
            v.extend_from_slice(b" PRINT");
            v
        });
        let p = payload("DATA PRINT,1");
        assert_eq!(p[0], TOKEN_DATA);
        assert!(!p[1..].contains(&TOKEN_PRINT));
    }

    #[test]
    fn test_star_command_verbatim() {
        let p = payload("*KEY 1 PRINT");
        assert_eq!(p, b"*KEY 1 PRINT".to_vec());
    }

    #[test]
    fn test_proc_names_not_tokenised() {
        let p = payload("PROCprint");
        assert_eq!(p, {
            let mut v = vec![TOKEN_PROC];
            v.extend_from_slice(b"print");
            v
        });
    }

    #[test]
    fn test_line_number_prefix() {
        let line = tokenize("  20 PRINT").unwrap();
        assert_eq!(line.line_number, Some(20));
        assert_eq!(line.tokens, vec![b' ', TOKEN_PRINT]);
        assert!(tokenize("65280 PRINT").is_err());
    }

    #[test]
    fn test_require_line_number() {
        let opts = TokenizeOptions { require_line_number: true, hex64: false };
        assert!(tokenize_with(b"PRINT", opts).is_err());
    }

    #[test]
    fn test_statement_too_long() {
        let long = format!("PRINT \"{}\"", "x".repeat(MAX_STATEMENT + 10));
        assert_eq!(tokenize(&long).unwrap_err().kind, ErrorKind::StateLen);
    }

    #[test]
    fn test_warnings() {
        assert_eq!(tokenize("PRINT \"abc").unwrap().warnings[0].kind, ErrorKind::WarnQuoteMiss);
        assert_eq!(tokenize("A=&").unwrap().warnings[0].kind, ErrorKind::WarnBadHex);
        assert_eq!(tokenize("A=%2").unwrap().warnings[0].kind, ErrorKind::WarnBadBin);
        assert_eq!(tokenize("A=1E999").unwrap().warnings[0].kind, ErrorKind::WarnExpOflo);
        assert_eq!(tokenize("A=(1").unwrap().warnings[0].kind, ErrorKind::WarnParNest);
        assert!(tokenize("A%=%101").unwrap().warnings.is_empty());
    }

    #[test]
    fn test_block_else_token() {
        assert_eq!(payload("ELSE"), vec![TOKEN_XELSE]);
        assert_eq!(payload("IF A THEN B ELSE C")[..1], [TOKEN_IF]);
        assert!(payload("IF A THEN B ELSE C").contains(&TOKEN_ELSE));
    }

    #[test]
    fn test_detokenize_round_trip() {
        for src in [
            "PRINT \"HELLO\"",
            "FOR I=1 TO 3:PRINT I;:NEXT",
            "IF A%>2 THEN GOTO 100 ELSE PROCfoo(1,\"x\")",
            "A$=LEFT$(B$,3)+MID$(C$,2)",
            "REM  anything goes here PRINT",
            "DATA 1,2,\"three\"",
            "ON ERROR LOCAL PRINT \"CAUGHT\":ENDPROC",
            "WHILE X<10:X+=1:ENDWHILE",
        ] {
            let line = tokenize(src).unwrap();
            assert_eq!(detokenize(&line).unwrap(), src);
        }
    }

    #[test]
    fn test_remap_line_numbers() {
        let mut p = payload("GOTO 10:GOSUB 30");
        let missing = remap_line_numbers(&mut p, &|n| if n == 10 { Some(100) } else { None });
        assert_eq!(missing, vec![30]);
        assert_eq!(expand(&p, false), "GOTO 100:GOSUB 30");
    }

    #[quickcheck_macros::quickcheck]
    fn prop_line_numbers_round_trip(n: u16) -> bool {
        let n = n % (MAX_LINENO as u16 + 1);
        decode_line_number(&encode_line_number(n)) == n
    }
}
