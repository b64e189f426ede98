//! MODE 7 teletext renderer
//!
//! The screen is a 40x25 grid of bytes. Rendering walks each row from
//! column 0 with a fresh attribute state. Control codes take effect either
//! at their own cell ("set-at") or from the next cell ("set-after"), so
//! each cell is processed in two passes: set-at codes update the state,
//! the cell is drawn, then set-after codes update the state.
//!
//! Two RGB frames are produced: one with flashing text visible and one
//! with it hidden. The display alternates between them.

use crate::vdu::font;

pub const COLUMNS: usize = 40;
pub const ROWS: usize = 25;
pub const CELL_WIDTH: usize = 16;
pub const CELL_HEIGHT: usize = 20;
pub const WIDTH: usize = COLUMNS * CELL_WIDTH;
pub const HEIGHT: usize = ROWS * CELL_HEIGHT;

/// The eight teletext colours
pub const COLOURS: [u32; 8] = [
    0x000000, 0xFF0000, 0x00FF00, 0xFFFF00, 0x0000FF, 0xFF00FF, 0x00FFFF, 0xFFFFFF,
];

/// SAA505x national character set variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Uk,
    German,
    Swedish,
    Italian,
    Belgian,
    Us,
    Hebrew,
    Cyrillic,
}

/// Character codes that differ between national sets
const NATIONAL_CODES: [u8; 13] = [0x23, 0x24, 0x40, 0x5B, 0x5C, 0x5D, 0x5E, 0x5F, 0x60, 0x7B, 0x7C, 0x7D, 0x7E];

const HEBREW: &str = "אבגדהוזחטיךכלםמןנסעףפץצקרשת";
const CYRILLIC: &str = "ЮАБЦДЕФГХИЙКЛМНОПЯРСТУЖВЬЫЗШЭЩЧЪ";

impl Region {
    pub fn from_number(n: u8) -> Self {
        match n & 7 {
            1 => Region::German,
            2 => Region::Swedish,
            3 => Region::Italian,
            4 => Region::Belgian,
            5 => Region::Us,
            6 => Region::Hebrew,
            7 => Region::Cyrillic,
            _ => Region::Uk,
        }
    }

    fn national(&self) -> [char; 13] {
        match self {
            Region::Uk => ['£', '$', '@', '←', '½', '→', '↑', '#', '—', '¼', '‖', '¾', '÷'],
            // The Hebrew letters take 0x60 to 0x7A; the other codes are as in the UK set
            Region::Hebrew => ['£', '$', '@', '←', '½', '→', '↑', '#', 'א', '¼', '‖', '¾', '÷'],
            Region::German => ['#', '$', '§', 'Ä', 'Ö', 'Ü', '^', '_', '°', 'ä', 'ö', 'ü', 'ß'],
            Region::Swedish => ['#', '¤', 'É', 'Ä', 'Ö', 'Å', 'Ü', '_', 'é', 'ä', 'ö', 'å', 'ü'],
            Region::Italian => ['£', '$', 'é', '°', 'ç', '→', '↑', '#', 'ù', 'à', 'ò', 'è', 'ì'],
            Region::Belgian => ['#', '$', 'à', 'ë', 'ê', 'ù', 'î', '#', 'è', 'â', 'ô', 'û', 'ç'],
            Region::Us => ['#', '$', '@', '[', '\\', ']', '^', '_', '`', '{', '|', '}', '~'],
            // The Cyrillic letters take 0x40 to 0x7E, leaving only # and $
            Region::Cyrillic => ['#', '$', 'Ю', 'Ш', 'Э', 'Щ', 'Ч', 'Ъ', 'ю', 'ш', 'э', 'щ', 'ч'],
        }
    }

    /// Character shown for a 7-bit code
    pub fn map(&self, code: u8) -> char {
        let code = code & 0x7F;
        match self {
            Region::Hebrew if (0x60..=0x7A).contains(&code) => {
                return HEBREW.chars().nth((code - 0x60) as usize).unwrap_or(' ');
            }
            Region::Cyrillic if (0x40..=0x7E).contains(&code) => {
                let c = CYRILLIC.chars().nth(((code - 0x40) & 0x1F) as usize).unwrap_or(' ');
                return if code >= 0x60 { c.to_lowercase().next().unwrap_or(c) } else { c };
            }
            _ => {}
        }
        match NATIONAL_CODES.iter().position(|&c| c == code) {
            Some(i) => self.national()[i],
            None => code as char,
        }
    }
}

fn accent(row0: u8, base: u8) -> [u8; 8] {
    let mut g = font::glyph(base);
    // Make room for the accent by dropping the top row of capitals
    if base.is_ascii_uppercase() {
        g = [0, g[0], g[1], g[2], g[3], g[4], g[6], g[7]];
    }
    g[0] |= row0;
    g
}

/// 8x8 shape of any character the national sets can produce
pub fn glyph(ch: char) -> [u8; 8] {
    const UMLAUT: u8 = 0x28;
    const ACUTE: u8 = 0x08;
    const GRAVE: u8 = 0x20;
    const CIRCUMFLEX: u8 = 0x38;
    const RING: u8 = 0x10;
    if ch.is_ascii() {
        return font::glyph(ch as u8);
    }
    match ch {
        '£' => [0x1C, 0x22, 0x20, 0x78, 0x20, 0x20, 0x7E, 0x00],
        '€' => [0x1C, 0x22, 0x78, 0x20, 0x78, 0x22, 0x1C, 0x00],
        '←' => [0x00, 0x10, 0x20, 0x7E, 0x20, 0x10, 0x00, 0x00],
        '→' => [0x00, 0x08, 0x04, 0x7E, 0x04, 0x08, 0x00, 0x00],
        '↑' => [0x10, 0x38, 0x54, 0x10, 0x10, 0x10, 0x10, 0x00],
        '½' => [0x20, 0x60, 0x22, 0x74, 0x0B, 0x12, 0x23, 0x00],
        '¼' => [0x20, 0x60, 0x22, 0x74, 0x0A, 0x1F, 0x22, 0x00],
        '¾' => [0x60, 0x10, 0x62, 0x14, 0x6A, 0x1F, 0x02, 0x00],
        '÷' => [0x00, 0x10, 0x00, 0x7C, 0x00, 0x10, 0x00, 0x00],
        '‖' => [0x28, 0x28, 0x28, 0x28, 0x28, 0x28, 0x28, 0x00],
        '—' => [0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00, 0x00],
        '§' => [0x3C, 0x40, 0x38, 0x44, 0x38, 0x04, 0x78, 0x00],
        '°' => [0x30, 0x48, 0x48, 0x30, 0x00, 0x00, 0x00, 0x00],
        '¤' => [0x00, 0x44, 0x38, 0x28, 0x38, 0x44, 0x00, 0x00],
        'ß' => [0x30, 0x48, 0x48, 0x70, 0x48, 0x48, 0x70, 0x40],
        'ç' => [0x00, 0x00, 0x38, 0x40, 0x40, 0x38, 0x10, 0x30],
        'Ä' => accent(UMLAUT, b'A'),
        'Ö' => accent(UMLAUT, b'O'),
        'Ü' => accent(UMLAUT, b'U'),
        'É' => accent(ACUTE, b'E'),
        'Å' => accent(RING, b'A'),
        'ä' => accent(UMLAUT, b'a'),
        'ö' => accent(UMLAUT, b'o'),
        'ü' => accent(UMLAUT, b'u'),
        'ë' => accent(UMLAUT, b'e'),
        'é' => accent(ACUTE, b'e'),
        'å' => accent(RING, b'a'),
        'à' => accent(GRAVE, b'a'),
        'è' => accent(GRAVE, b'e'),
        'ì' => accent(GRAVE, b'i'),
        'ò' => accent(GRAVE, b'o'),
        'ù' => accent(GRAVE, b'u'),
        'â' => accent(CIRCUMFLEX, b'a'),
        'ê' => accent(CIRCUMFLEX, b'e'),
        'î' => accent(CIRCUMFLEX, b'i'),
        'ô' => accent(CIRCUMFLEX, b'o'),
        'û' => accent(CIRCUMFLEX, b'u'),
        _ => lookalike(ch),
    }
}

/// Cyrillic and Hebrew letters: a Latin letter of the same shape where
/// there is one, otherwise an outlined box
fn lookalike(ch: char) -> [u8; 8] {
    let latin = match ch.to_uppercase().next().unwrap_or(ch) {
        'А' => Some(b'A'),
        'В' => Some(b'B'),
        'Е' => Some(b'E'),
        'К' => Some(b'K'),
        'М' => Some(b'M'),
        'Н' => Some(b'H'),
        'О' => Some(b'O'),
        'Р' => Some(b'P'),
        'С' => Some(b'C'),
        'Т' => Some(b'T'),
        'Х' => Some(b'X'),
        'У' => Some(b'Y'),
        'З' => Some(b'3'),
        'Б' => Some(b'6'),
        'ו' => Some(b'I'),
        'ן' => Some(b'l'),
        'ס' => Some(b'o'),
        _ => None,
    };
    match latin {
        Some(c) if ch.is_lowercase() => font::glyph(c.to_ascii_lowercase()),
        Some(c) => font::glyph(c),
        None => [0x00, 0x7C, 0x44, 0x44, 0x44, 0x7C, 0x00, 0x00],
    }
}

/// Per-row attribute state
#[derive(Debug, Clone, Copy)]
struct Attributes {
    fg: u8,
    bg: u8,
    graphics: bool,
    separated: bool,
    double: bool,
    flash: bool,
    conceal: bool,
    hold: bool,
    held: u8,
    held_separated: bool,
}

impl Attributes {
    fn new() -> Self {
        Self {
            fg: 7,
            bg: 0,
            graphics: false,
            separated: false,
            double: false,
            flash: false,
            conceal: false,
            hold: false,
            held: b' ',
            held_separated: false,
        }
    }
}

/// The MODE 7 character store and renderer
#[derive(Debug, Clone)]
pub struct Teletext {
    frame: [[u8; COLUMNS]; ROWS],
    shadow: [[u8; COLUMNS]; ROWS],
    /// Row was the top half of a double height pair when last rendered
    double_top: [bool; ROWS],
    stale: [bool; ROWS],
    /// Show concealed text (VDU 23,18,1)
    pub reveal: bool,
    /// Codes 128 and 144 select black (VDU 23,18,2)
    pub black_enable: bool,
    /// Emulate the SAA5050 clearing the held character on a size or
    /// alpha/graphics change (VDU 23,18,3)
    pub hold_bug: bool,
    pub primary: Region,
    pub alternate: Region,
    /// Show a Euro sign for `$`
    pub euro: bool,
}

impl Default for Teletext {
    fn default() -> Self {
        Self::new()
    }
}

impl Teletext {
    pub fn new() -> Self {
        Self {
            frame: [[b' '; COLUMNS]; ROWS],
            shadow: [[b' '; COLUMNS]; ROWS],
            double_top: [false; ROWS],
            stale: [true; ROWS],
            reveal: false,
            black_enable: false,
            hold_bug: false,
            primary: Region::Uk,
            alternate: Region::Uk,
            euro: false,
        }
    }

    pub fn get(&self, col: usize, row: usize) -> u8 {
        self.frame.get(row).and_then(|r| r.get(col)).copied().unwrap_or(b' ')
    }

    pub fn put(&mut self, col: usize, row: usize, code: u8) {
        if let Some(cell) = self.frame.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = code;
        }
    }

    /// Fill a rectangle of cells
    pub fn clear(&mut self, left: usize, top: usize, right: usize, bottom: usize) {
        for row in top..=bottom.min(ROWS - 1) {
            for col in left..=right.min(COLUMNS - 1) {
                self.frame[row][col] = b' ';
            }
        }
    }

    /// Move a block of cells by `(dx, dy)` inside the window, blanking
    /// the cells uncovered
    pub fn shift(&mut self, left: usize, top: usize, right: usize, bottom: usize, dx: isize, dy: isize) {
        let old = self.frame;
        for row in top..=bottom.min(ROWS - 1) {
            for col in left..=right.min(COLUMNS - 1) {
                let src_row = row as isize - dy;
                let src_col = col as isize - dx;
                let inside = src_row >= top as isize
                    && src_row <= bottom as isize
                    && src_col >= left as isize
                    && src_col <= right as isize;
                self.frame[row][col] = if inside { old[src_row as usize][src_col as usize] } else { b' ' };
            }
        }
    }

    /// Select national sets from a VDU 23,18,4 selector
    pub fn set_charsets(&mut self, primary: u8, alternate: u8) {
        self.primary = Region::from_number(primary);
        self.alternate = Region::from_number(alternate);
        self.euro = primary & 0x80 != 0;
        self.invalidate();
    }

    /// Force every row to re-render
    pub fn invalidate(&mut self) {
        self.stale = [true; ROWS];
    }

    fn character(&self, code: u8) -> char {
        if self.euro && code & 0x7F == 0x24 {
            return '€';
        }
        self.primary.map(code)
    }

    /// Re-render changed rows into the flash-on and flash-off frames
    /// (`WIDTH` x `HEIGHT` RGB). Returns the rows that were redrawn.
    pub fn render(&mut self, on: &mut [u32], off: &mut [u32]) -> Vec<usize> {
        let mut redrawn = Vec::new();
        let mut previous_changed = false;
        let mut previous_top = false;
        for row in 0..ROWS {
            let changed = self.stale[row] || self.frame[row] != self.shadow[row];
            let is_bottom = previous_top;
            let needed = changed || (previous_changed && (is_bottom || self.double_top[row]));
            let top = if needed {
                let source = if is_bottom { row - 1 } else { row };
                let double = self.render_row(source, row, is_bottom, on, off);
                redrawn.push(row);
                !is_bottom && double
            } else {
                self.double_top[row]
            };
            self.double_top[row] = top;
            previous_changed = needed;
            previous_top = top;
        }
        self.shadow = self.frame;
        self.stale = [false; ROWS];
        redrawn
    }

    /// Draw the row of codes at `source` onto screen row `row`. Returns
    /// whether the row contains double height text.
    fn render_row(&self, source: usize, row: usize, bottom: bool, on: &mut [u32], off: &mut [u32]) -> bool {
        let mut attr = Attributes::new();
        let mut any_double = false;
        for col in 0..COLUMNS {
            let code = self.frame[source][col] & 0x7F;
            let control = code < 0x20;
            // Set-at codes
            if control {
                match code {
                    0x09 => attr.flash = false,
                    0x0C => {
                        if attr.double && self.hold_bug {
                            attr.held = b' ';
                        }
                        attr.double = false;
                    }
                    0x18 => attr.conceal = true,
                    0x19 => attr.separated = false,
                    0x1A => attr.separated = true,
                    0x1C => attr.bg = 0,
                    0x1D => attr.bg = attr.fg,
                    0x1E => attr.hold = true,
                    _ => {}
                }
            }
            let visible = if control {
                if attr.hold && attr.graphics { Some((attr.held, attr.held_separated)) } else { None }
            } else {
                Some((code, attr.separated))
            };
            let cell_double = attr.double;
            any_double |= cell_double;
            let x0 = col * CELL_WIDTH;
            let y0 = row * CELL_HEIGHT;
            let mut bits = [0u32; CELL_HEIGHT];
            if let Some((c, separated)) = visible {
                let is_mosaic = attr.graphics && (c & 0x20) != 0 && c >= 0x20;
                if !(bottom && !cell_double) && !(attr.conceal && !self.reveal) {
                    bits = if is_mosaic {
                        mosaic(c, separated)
                    } else {
                        let shape = glyph(self.character(c));
                        scale(&shape, cell_double, bottom)
                    };
                    if is_mosaic && cell_double {
                        bits = double_mosaic(&bits, bottom);
                    }
                }
                if is_mosaic {
                    attr.held = c;
                    attr.held_separated = separated;
                }
            }
            let fg = COLOURS[attr.fg as usize];
            let bg = COLOURS[attr.bg as usize];
            for (dy, line) in bits.iter().enumerate() {
                let base = (y0 + dy) * WIDTH + x0;
                for dx in 0..CELL_WIDTH {
                    let ink = line & (1 << (CELL_WIDTH - 1 - dx)) != 0;
                    if let Some(p) = on.get_mut(base + dx) {
                        *p = if ink { fg } else { bg };
                    }
                    if let Some(p) = off.get_mut(base + dx) {
                        *p = if ink && !attr.flash { fg } else { bg };
                    }
                }
            }
            // Set-after codes
            if control {
                match code {
                    0x00 | 0x10 if !self.black_enable => {}
                    0x00..=0x07 => {
                        if attr.graphics && self.hold_bug {
                            attr.held = b' ';
                        }
                        attr.fg = code;
                        attr.graphics = false;
                        attr.conceal = false;
                    }
                    0x08 => attr.flash = true,
                    0x0D => {
                        if !attr.double && self.hold_bug {
                            attr.held = b' ';
                        }
                        attr.double = true;
                    }
                    0x10..=0x17 => {
                        attr.fg = code - 0x10;
                        attr.graphics = true;
                        attr.conceal = false;
                    }
                    0x1F => attr.hold = false,
                    _ => {}
                }
            }
        }
        any_double
    }
}

/// 8x8 glyph to 16 pixel wide rows for one cell
fn scale(shape: &[u8; 8], double: bool, bottom: bool) -> [u32; CELL_HEIGHT] {
    let mut out = [0u32; CELL_HEIGHT];
    for (y, line) in out.iter_mut().enumerate() {
        let src = if double {
            (y * 4) / CELL_HEIGHT + if bottom { 4 } else { 0 }
        } else {
            (y * 8) / CELL_HEIGHT
        };
        let byte = shape[src] as u32;
        let mut wide = 0u32;
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                wide |= 0b11 << (14 - bit * 2);
            }
        }
        *line = wide;
    }
    out
}

/// Sextant block graphics for a mosaic code
fn mosaic(code: u8, separated: bool) -> [u32; CELL_HEIGHT] {
    const BANDS: [(usize, usize); 3] = [(0, 7), (7, 14), (14, 20)];
    let sextants = (code & 0x1F) | ((code & 0x40) >> 1);
    let mut out = [0u32; CELL_HEIGHT];
    for (band, &(start, end)) in BANDS.iter().enumerate() {
        let left = sextants & (1 << (band * 2)) != 0;
        let right = sextants & (1 << (band * 2 + 1)) != 0;
        let mut mask = 0u32;
        if left {
            mask |= if separated { 0x3F00 } else { 0xFF00 };
        }
        if right {
            mask |= if separated { 0x003F } else { 0x00FF };
        }
        let end = if separated { end - 2 } else { end };
        for line in &mut out[start..end] {
            *line = mask;
        }
    }
    out
}

/// Stretch a mosaic cell vertically, taking the top or bottom half
fn double_mosaic(bits: &[u32; CELL_HEIGHT], bottom: bool) -> [u32; CELL_HEIGHT] {
    let mut out = [0u32; CELL_HEIGHT];
    let offset = if bottom { CELL_HEIGHT / 2 } else { 0 };
    for (y, line) in out.iter_mut().enumerate() {
        *line = bits[offset + y / 2];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surfaces() -> (Vec<u32>, Vec<u32>) {
        (vec![0; WIDTH * HEIGHT], vec![0; WIDTH * HEIGHT])
    }

    fn cell_has_colour(frame: &[u32], col: usize, row: usize, colour: u32) -> bool {
        (0..CELL_HEIGHT).any(|dy| {
            (0..CELL_WIDTH).any(|dx| frame[(row * CELL_HEIGHT + dy) * WIDTH + col * CELL_WIDTH + dx] == colour)
        })
    }

    #[test]
    fn test_unchanged_rows_are_not_redrawn() {
        let mut t = Teletext::new();
        let (mut on, mut off) = surfaces();
        assert_eq!(t.render(&mut on, &mut off).len(), ROWS);
        t.put(3, 5, b'A');
        assert_eq!(t.render(&mut on, &mut off), vec![5]);
        let before = on.clone();
        assert!(t.render(&mut on, &mut off).is_empty());
        assert_eq!(on, before);
    }

    #[test]
    fn test_alpha_colour_is_set_after() {
        let mut t = Teletext::new();
        let (mut on, mut off) = surfaces();
        t.put(0, 0, 0x81);
        t.put(1, 0, b'X');
        t.render(&mut on, &mut off);
        assert!(!cell_has_colour(&on, 0, 0, COLOURS[1]));
        assert!(cell_has_colour(&on, 1, 0, COLOURS[1]));
    }

    #[test]
    fn test_new_background_is_set_at() {
        let mut t = Teletext::new();
        let (mut on, mut off) = surfaces();
        t.put(0, 0, 0x84);
        t.put(1, 0, 0x9D);
        t.render(&mut on, &mut off);
        assert!(cell_has_colour(&on, 1, 0, COLOURS[4]));
        assert!(!cell_has_colour(&on, 0, 0, COLOURS[4]));
    }

    #[test]
    fn test_flash_hidden_in_off_frame() {
        let mut t = Teletext::new();
        let (mut on, mut off) = surfaces();
        t.put(0, 0, 0x88);
        t.put(1, 0, b'H');
        t.render(&mut on, &mut off);
        assert!(cell_has_colour(&on, 1, 0, COLOURS[7]));
        assert!(!cell_has_colour(&off, 1, 0, COLOURS[7]));
    }

    #[test]
    fn test_double_height_reaches_next_row() {
        let mut t = Teletext::new();
        let (mut on, mut off) = surfaces();
        t.render(&mut on, &mut off);
        t.put(0, 2, 0x8D);
        t.put(1, 2, b'I');
        assert_eq!(t.render(&mut on, &mut off), vec![2, 3]);
        assert!(cell_has_colour(&on, 1, 3, COLOURS[7]));
    }

    #[test]
    fn test_graphics_and_separated() {
        let full = mosaic(0x7F, false);
        assert!(full.iter().all(|&l| l == 0xFFFF));
        let sep = mosaic(0x7F, true);
        assert_eq!(sep[0], 0x3F3F);
        assert_eq!(sep[5], 0);
        assert_eq!(mosaic(0x21, false)[0], 0xFF00);
    }

    #[test]
    fn test_national_sets() {
        assert_eq!(Region::Uk.map(0x23), '£');
        assert_eq!(Region::German.map(0x5B), 'Ä');
        assert_eq!(Region::Us.map(0x5B), '[');
        assert_eq!(Region::Cyrillic.map(0x41), 'А');
        assert_eq!(Region::Cyrillic.map(0x61), 'а');
        assert_eq!(Region::Hebrew.map(0x60), 'א');
        assert_eq!(Region::Hebrew.map(0x23), '£');
        assert_eq!(Region::Hebrew.map(0x7E), '÷');
        assert_eq!(Region::Cyrillic.map(0x24), '$');
        assert_eq!(Region::Cyrillic.map(0x5E), 'Ч');
        assert_ne!(glyph('Ä'), glyph('A'));
        assert_eq!(glyph('а'), font::glyph(b'a'));
    }

    #[test]
    fn test_shift_right_blanks_first_column() {
        let mut t = Teletext::new();
        t.put(0, 0, b'X');
        t.shift(0, 0, 39, 24, 1, 0);
        assert_eq!(t.get(0, 0), b' ');
        assert_eq!(t.get(1, 0), b'X');
    }
}
