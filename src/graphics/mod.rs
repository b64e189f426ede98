//! Graphics renderer
//!
//! Drawing targets a [`Canvas`] of logical colour numbers (the write bank).
//! Coordinates arrive in RISC OS graphics units with the origin at the
//! bottom left; [`Graphics`] converts them to pixels using the mode's
//! `xeig`/`yeig`, applies the current GCOL action and clips to the graphics
//! window. After drawing, the changed rectangle is copied to the display
//! surface by [`blit`], which maps colour numbers through the palette and
//! scales each pixel by the mode's pixel size.

use crate::error::{BasicError, ErrorKind, Result};

/// Inclusive pixel rectangle, top left origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left: left.min(right),
            top: top.min(bottom),
            right: left.max(right),
            bottom: top.max(bottom),
        }
    }

    pub fn union(self, other: Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn intersect(self, other: Rect) -> Option<Rect> {
        let r = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        };
        (r.left <= r.right && r.top <= r.bottom).then_some(r)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    pub fn width(&self) -> i32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top + 1
    }
}

/// GCOL plot actions
pub const ACTION_REPLACE: u8 = 0;
pub const ACTION_OR: u8 = 1;
pub const ACTION_AND: u8 = 2;
pub const ACTION_EOR: u8 = 3;
pub const ACTION_INVERT: u8 = 4;
pub const ACTION_NONE: u8 = 5;
pub const ACTION_AND_NOT: u8 = 6;
pub const ACTION_OR_NOT: u8 = 7;

/// Combine `colour` into `dest` with a GCOL action, keeping `mask` bits
pub fn blend(dest: u32, colour: u32, action: u8, mask: u32) -> u32 {
    let out = match action & 7 {
        ACTION_REPLACE => colour,
        ACTION_OR => dest | colour,
        ACTION_AND => dest & colour,
        ACTION_EOR => dest ^ colour,
        ACTION_INVERT => !dest,
        ACTION_NONE => dest,
        ACTION_AND_NOT => dest & !colour,
        _ => dest | !colour,
    };
    out & mask
}

/// The write bank: one logical colour number per pixel
#[derive(Debug, Clone)]
pub struct Canvas {
    width: usize,
    height: usize,
    pixels: Vec<u32>,
    dirty: Option<Rect>,
}

impl Canvas {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, pixels: vec![0; width * height], dirty: None }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width as i32 - 1, self.height as i32 - 1)
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Colour number at a pixel, `None` off the canvas
    pub fn get(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.pixels[y as usize * self.width + x as usize])
    }

    /// Write a pixel without any action
    pub fn put(&mut self, x: i32, y: i32, colour: u32) {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return;
        }
        self.pixels[y as usize * self.width + x as usize] = colour;
        self.touch(Rect::new(x, y, x, y));
    }

    /// Record that `rect` has changed since the last blit
    pub fn touch(&mut self, rect: Rect) {
        self.dirty = Some(match self.dirty {
            Some(d) => d.union(rect),
            None => rect,
        });
    }

    /// Changed area since the last call, clipped to the canvas
    pub fn take_dirty(&mut self) -> Option<Rect> {
        self.dirty.take().and_then(|d| d.intersect(self.bounds()))
    }

    /// Fill a rectangle with a plain colour
    pub fn fill_rect(&mut self, rect: Rect, colour: u32) {
        let Some(r) = rect.intersect(self.bounds()) else { return };
        for y in r.top..=r.bottom {
            let row = y as usize * self.width;
            self.pixels[row + r.left as usize..=row + r.right as usize].fill(colour);
        }
        self.touch(r);
    }

    pub fn clear(&mut self, colour: u32) {
        self.fill_rect(self.bounds(), colour);
    }

    /// Copy a block of pixels. Source and destination may overlap.
    pub fn copy_rect(&mut self, src: Rect, dest_left: i32, dest_top: i32) {
        let Some(src) = src.intersect(self.bounds()) else { return };
        let mut block = Vec::with_capacity((src.width() * src.height()) as usize);
        for y in src.top..=src.bottom {
            let row = y as usize * self.width;
            block.extend_from_slice(&self.pixels[row + src.left as usize..=row + src.right as usize]);
        }
        let w = src.width();
        for dy in 0..src.height() {
            for dx in 0..w {
                let colour = block[(dy * w + dx) as usize];
                self.put(dest_left + dx, dest_top + dy, colour);
            }
        }
    }
}

/// A colour and the action used to plot it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pen {
    pub colour: u32,
    pub action: u8,
}

/// Graphics cursor, window and colour state for the current mode
#[derive(Debug, Clone)]
pub struct Graphics {
    pub xeig: u32,
    pub yeig: u32,
    /// Canvas size in pixels
    pub width: i32,
    pub height: i32,
    /// Largest colour number plus one, minus one
    pub mask: u32,
    /// Graphics origin in graphics units
    pub origin: (i32, i32),
    /// Last three visited points, most recent first, in absolute units
    pub last: [(i32, i32); 3],
    /// Graphics window in pixels
    pub clip: Rect,
    pub fg: Pen,
    pub bg: Pen,
    /// Dotted line pattern, most significant bit first
    pub dot_pattern: u64,
    pub dot_length: u32,
    dot_phase: u32,
    /// Ceiling on flood fill work
    pub max_fill: usize,
}

impl Graphics {
    pub fn new(width: usize, height: usize, xeig: u32, yeig: u32, colours: u32) -> Self {
        let mask = colours.saturating_sub(1).max(1);
        Self {
            xeig,
            yeig,
            width: width as i32,
            height: height as i32,
            mask,
            origin: (0, 0),
            last: [(0, 0); 3],
            clip: Rect::new(0, 0, width as i32 - 1, height as i32 - 1),
            fg: Pen { colour: mask, action: ACTION_REPLACE },
            bg: Pen { colour: 0, action: ACTION_REPLACE },
            dot_pattern: 0xAAAA_AAAA_AAAA_AAAA,
            dot_length: 8,
            dot_phase: 0,
            max_fill: 2000 * 64,
        }
    }

    /// Horizontal graphics-unit coordinate to pixel column
    pub fn to_px(&self, x: i32) -> i32 {
        x >> self.xeig
    }

    /// Vertical graphics-unit coordinate to pixel row
    pub fn to_py(&self, y: i32) -> i32 {
        self.height - 1 - (y >> self.yeig)
    }

    /// Pixel row to the graphics-unit coordinate of its centre
    fn from_py(&self, py: i32) -> f64 {
        (((self.height - 1 - py) << self.yeig) + (1 << self.yeig) / 2) as f64
    }

    /// Graphics cursor relative to the origin
    pub fn cursor(&self) -> (i32, i32) {
        (self.last[0].0 - self.origin.0, self.last[0].1 - self.origin.1)
    }

    /// Size of the screen in graphics units
    pub fn units(&self) -> (i32, i32) {
        (self.width << self.xeig, self.height << self.yeig)
    }

    /// Set the graphics window from graphics-unit corners (VDU 24)
    pub fn set_window(&mut self, left: i32, bottom: i32, right: i32, top: i32) -> Result<()> {
        let (l, b) = (left + self.origin.0, bottom + self.origin.1);
        let (r, t) = (right + self.origin.0, top + self.origin.1);
        if l > r || b > t {
            return Err(ErrorKind::BadWindow.into());
        }
        let rect = Rect::new(self.to_px(l), self.to_py(t), self.to_px(r), self.to_py(b));
        let screen = Rect::new(0, 0, self.width - 1, self.height - 1);
        self.clip = rect.intersect(screen).ok_or_else(|| BasicError::new(ErrorKind::BadWindow))?;
        Ok(())
    }

    pub fn reset_window(&mut self) {
        self.clip = Rect::new(0, 0, self.width - 1, self.height - 1);
    }

    /// Record a visited point in absolute graphics units
    pub fn visit(&mut self, x: i32, y: i32) {
        self.last[2] = self.last[1];
        self.last[1] = self.last[0];
        self.last[0] = (x, y);
    }

    fn plot_pixel(&self, canvas: &mut Canvas, x: i32, y: i32, pen: Pen) {
        if !self.clip.contains(x, y) {
            return;
        }
        if let Some(dest) = canvas.get(x, y) {
            canvas.put(x, y, blend(dest, pen.colour, pen.action, self.mask));
        }
    }

    fn span(&self, canvas: &mut Canvas, y: i32, x0: i32, x1: i32, pen: Pen) {
        if y < self.clip.top || y > self.clip.bottom {
            return;
        }
        let (l, r) = (x0.min(x1).max(self.clip.left), x0.max(x1).min(self.clip.right));
        for x in l..=r {
            self.plot_pixel(canvas, x, y, pen);
        }
    }

    /// Execute a PLOT command. `x`,`y` are the coordinates as given to PLOT.
    pub fn plot(&mut self, canvas: &mut Canvas, code: u8, x: i32, y: i32) -> Result<()> {
        let (ax, ay) = if code & 4 != 0 {
            (x + self.origin.0, y + self.origin.1)
        } else {
            (self.last[0].0 + x, self.last[0].1 + y)
        };
        let pen = match code & 3 {
            0 => None,
            1 => Some(self.fg),
            2 => Some(Pen { colour: 0, action: ACTION_INVERT }),
            _ => Some(self.bg),
        };
        let group = code & 0xF8;
        if let Some(pen) = pen {
            match group {
                0x00..=0x38 => self.line_styled(canvas, group, self.last[0], (ax, ay), pen),
                0x40 => self.plot_pixel(canvas, self.to_px(ax), self.to_py(ay), pen),
                0x48 => self.line_fill(canvas, (ax, ay), pen, true, true, false),
                0x50 => self.triangle(canvas, self.last[1], self.last[0], (ax, ay), pen),
                0x58 => self.line_fill(canvas, (ax, ay), pen, false, false, false),
                0x60 => self.rectangle(canvas, self.last[0], (ax, ay), pen),
                0x68 => self.line_fill(canvas, (ax, ay), pen, true, true, true),
                0x70 => {
                    let (p1, p2, p3) = (self.last[1], self.last[0], (ax, ay));
                    let p4 = (p1.0 + p3.0 - p2.0, p1.1 + p3.1 - p2.1);
                    self.triangle(canvas, p1, p2, p3, pen);
                    self.triangle(canvas, p1, p3, p4, pen);
                }
                0x78 => self.line_fill(canvas, (ax, ay), pen, false, true, true),
                0x80 => self.flood_fill(canvas, (ax, ay), pen, false),
                0x88 => self.flood_fill(canvas, (ax, ay), pen, true),
                0x90 | 0x98 => {
                    let r = distance(self.last[0], (ax, ay));
                    self.ellipse(canvas, self.last[0], r, r, 0.0, group == 0x98, pen);
                }
                0xA0 | 0xA8 | 0xB0 => {
                    self.arc(canvas, self.last[1], self.last[0], (ax, ay), group, pen)
                }
                0xB8 => {
                    let src = Rect::new(
                        self.to_px(self.last[1].0),
                        self.to_py(self.last[1].1),
                        self.to_px(self.last[0].0),
                        self.to_py(self.last[0].1),
                    );
                    self.block_copy(canvas, src, (ax, ay), code & 3 == 1);
                }
                0xC0 | 0xC8 => {
                    let centre = self.last[1];
                    let a = (self.last[0].0 - centre.0).abs() as f64;
                    let b = (ay - centre.1).abs() as f64;
                    let shear = (ax - centre.0) as f64;
                    self.sheared_ellipse(canvas, centre, a, b, shear, group == 0xC8, pen);
                }
                _ => return Err(BasicError::new(ErrorKind::BadPlot).with_int(code as i64)),
            }
        } else if group >= 0xD0 {
            return Err(BasicError::new(ErrorKind::BadPlot).with_int(code as i64));
        }
        self.visit(ax, ay);
        Ok(())
    }

    /// Draw a line between two absolute points with PLOT style bits
    fn line_styled(&mut self, canvas: &mut Canvas, style: u8, from: (i32, i32), to: (i32, i32), pen: Pen) {
        let dotted = style & 0x10 != 0;
        let (skip_first, skip_last) = match style & 0x28 {
            0x00 => (false, false),
            0x08 => (false, true),
            0x20 => (true, false),
            _ => (true, true),
        };
        if !skip_first {
            self.dot_phase = 0;
        }
        let points = bresenham(
            (self.to_px(from.0), self.to_py(from.1)),
            (self.to_px(to.0), self.to_py(to.1)),
        );
        let count = points.len();
        for (i, (x, y)) in points.into_iter().enumerate() {
            if (i == 0 && skip_first) || (i + 1 == count && skip_last && count > 1) {
                continue;
            }
            if dotted {
                let bit = self.dot_phase % self.dot_length.max(1);
                self.dot_phase = bit + 1;
                if self.dot_pattern & (1u64 << (63 - bit)) == 0 {
                    continue;
                }
            }
            self.plot_pixel(canvas, x, y, pen);
        }
    }

    /// Solid line between two absolute points, both ends plotted
    pub fn line(&mut self, canvas: &mut Canvas, from: (i32, i32), to: (i32, i32), pen: Pen) {
        self.line_styled(canvas, 0, from, to, pen);
    }

    pub fn rectangle(&self, canvas: &mut Canvas, a: (i32, i32), b: (i32, i32), pen: Pen) {
        let r = Rect::new(self.to_px(a.0), self.to_py(a.1), self.to_px(b.0), self.to_py(b.1));
        for y in r.top..=r.bottom {
            self.span(canvas, y, r.left, r.right, pen);
        }
    }

    /// Filled triangle by edge tracing and horizontal spans
    pub fn triangle(&self, canvas: &mut Canvas, a: (i32, i32), b: (i32, i32), c: (i32, i32), pen: Pen) {
        let pts = [a, b, c].map(|(x, y)| (self.to_px(x) as f64, self.to_py(y) as f64));
        let top = pts.iter().map(|p| p.1).fold(f64::MAX, f64::min) as i32;
        let bottom = pts.iter().map(|p| p.1).fold(f64::MIN, f64::max) as i32;
        for y in top..=bottom {
            let fy = y as f64;
            let mut lo = f64::MAX;
            let mut hi = f64::MIN;
            for i in 0..3 {
                let (p, q) = (pts[i], pts[(i + 1) % 3]);
                if (fy < p.1.min(q.1)) || (fy > p.1.max(q.1)) {
                    continue;
                }
                if p.1 == q.1 {
                    lo = lo.min(p.0.min(q.0));
                    hi = hi.max(p.0.max(q.0));
                } else {
                    let x = p.0 + (fy - p.1) * (q.0 - p.0) / (q.1 - p.1);
                    lo = lo.min(x);
                    hi = hi.max(x);
                }
            }
            if lo <= hi {
                self.span(canvas, y, lo.round() as i32, hi.round() as i32, pen);
            }
        }
    }

    /// Horizontal line fills (PLOT 72, 88, 104, 120). `both` fills left
    /// as well as right; `until_fg` stops at the foreground colour instead
    /// of the background; `stop_on_match` stops when the boundary colour is
    /// found rather than when it is left.
    fn line_fill(&self, canvas: &mut Canvas, at: (i32, i32), pen: Pen, both: bool, stop_on_match: bool, until_fg: bool) {
        let (x, y) = (self.to_px(at.0), self.to_py(at.1));
        if !self.clip.contains(x, y) {
            return;
        }
        let boundary = if until_fg { self.fg.colour } else { self.bg.colour };
        let fillable = |c: Option<u32>| match c {
            Some(c) if stop_on_match => c != boundary,
            Some(c) => c == boundary,
            None => false,
        };
        if !fillable(canvas.get(x, y)) {
            return;
        }
        let mut right = x;
        while right < self.clip.right && fillable(canvas.get(right + 1, y)) {
            right += 1;
        }
        let mut left = x;
        if both {
            while left > self.clip.left && fillable(canvas.get(left - 1, y)) {
                left -= 1;
            }
        }
        self.span(canvas, y, left, right, pen);
    }

    /// Flood fill from a point. Fills the region of background colour, or
    /// everything up to the foreground colour with `until_fg`.
    pub fn flood_fill(&self, canvas: &mut Canvas, at: (i32, i32), pen: Pen, until_fg: bool) {
        let (x, y) = (self.to_px(at.0), self.to_py(at.1));
        if !self.clip.contains(x, y) {
            return;
        }
        let target = if until_fg { self.fg.colour } else { self.bg.colour };
        let inside = |c: Option<u32>| match c {
            Some(c) if until_fg => c != target,
            Some(c) => c == target,
            None => false,
        };
        if !inside(canvas.get(x, y)) {
            return;
        }
        let width = (self.clip.width()) as usize;
        let height = (self.clip.height()) as usize;
        let mut seen = vec![false; width * height];
        let index = |x: i32, y: i32| (y - self.clip.top) as usize * width + (x - self.clip.left) as usize;
        let mut pending = vec![(x, y)];
        let mut work = 0usize;
        while let Some((sx, sy)) = pending.pop() {
            work += 1;
            if work > self.max_fill {
                break;
            }
            if seen[index(sx, sy)] || !inside(canvas.get(sx, sy)) {
                continue;
            }
            let mut left = sx;
            while left > self.clip.left && !seen[index(left - 1, sy)] && inside(canvas.get(left - 1, sy)) {
                left -= 1;
            }
            let mut right = sx;
            while right < self.clip.right && !seen[index(right + 1, sy)] && inside(canvas.get(right + 1, sy)) {
                right += 1;
            }
            for px in left..=right {
                seen[index(px, sy)] = true;
            }
            for ny in [sy - 1, sy + 1] {
                if ny < self.clip.top || ny > self.clip.bottom {
                    continue;
                }
                let mut px = left;
                while px <= right {
                    if !seen[index(px, ny)] && inside(canvas.get(px, ny)) {
                        pending.push((px, ny));
                        while px <= right && inside(canvas.get(px, ny)) {
                            px += 1;
                        }
                    }
                    px += 1;
                }
            }
        }
        for py in self.clip.top..=self.clip.bottom {
            for px in self.clip.left..=self.clip.right {
                if seen[index(px, py)] {
                    self.plot_pixel(canvas, px, py, pen);
                }
            }
        }
    }

    /// Rows of a conic centred on `centre`. `half_width` maps a vertical
    /// offset in graphics units to the left and right offsets of the curve.
    fn conic_rows(&self, centre: (i32, i32), height: f64, half_width: impl Fn(f64) -> Option<(f64, f64)>) -> Vec<(i32, i32, i32)> {
        let top = self.to_py(centre.1 + height.round() as i32);
        let bottom = self.to_py(centre.1 - height.round() as i32);
        let mut rows = Vec::new();
        for py in top..=bottom {
            let dy = (self.from_py(py) - centre.1 as f64).clamp(-height, height);
            if let Some((l, r)) = half_width(dy) {
                let xl = self.to_px(centre.0 + l.round() as i32);
                let xr = self.to_px(centre.0 + r.round() as i32);
                rows.push((py, xl.min(xr), xl.max(xr)));
            }
        }
        rows
    }

    fn draw_rows(&self, canvas: &mut Canvas, rows: &[(i32, i32, i32)], fill: bool, pen: Pen) {
        if fill {
            for &(y, l, r) in rows {
                self.span(canvas, y, l, r, pen);
            }
            return;
        }
        let mut previous: Option<(i32, i32)> = None;
        for &(y, l, r) in rows {
            match previous {
                // Join successive slices so steep parts of the curve have no gaps
                Some((pl, pr)) => {
                    if l < pl {
                        self.span(canvas, y, l, pl - 1, pen);
                    } else if l > pl {
                        self.span(canvas, y, pl + 1, l, pen);
                    } else {
                        self.plot_pixel(canvas, l, y, pen);
                    }
                    if r > pr {
                        self.span(canvas, y, pr + 1, r, pen);
                    } else if r < pr {
                        self.span(canvas, y, r, pr - 1, pen);
                    } else {
                        self.plot_pixel(canvas, r, y, pen);
                    }
                }
                None => self.span(canvas, y, l, r, pen),
            }
            previous = Some((l, r));
        }
        if let Some(&(y, l, r)) = rows.last() {
            self.span(canvas, y, l, r, pen);
        }
    }

    /// Ellipse with semi-axes `a` (x) and `b` (y) rotated by `angle` radians
    pub fn ellipse(&self, canvas: &mut Canvas, centre: (i32, i32), a: f64, b: f64, angle: f64, fill: bool, pen: Pen) {
        let (a, b) = (a.max(0.5), b.max(0.5));
        let (s, c) = angle.sin_cos();
        let ca = c * c / (a * a) + s * s / (b * b);
        let cb = 2.0 * c * s * (1.0 / (a * a) - 1.0 / (b * b));
        let cc = s * s / (a * a) + c * c / (b * b);
        let height = (4.0 * ca / (4.0 * ca * cc - cb * cb)).sqrt();
        let rows = self.conic_rows(centre, height, |dy| {
            let disc = (cb * dy).powi(2) - 4.0 * ca * (cc * dy * dy - 1.0);
            let root = disc.max(0.0).sqrt();
            Some(((-cb * dy - root) / (2.0 * ca), (-cb * dy + root) / (2.0 * ca)))
        });
        self.draw_rows(canvas, &rows, fill, pen);
    }

    /// Ellipse given by semi-axes and an X shear at the top of the curve
    pub fn sheared_ellipse(&self, canvas: &mut Canvas, centre: (i32, i32), a: f64, b: f64, shear: f64, fill: bool, pen: Pen) {
        let b = b.max(0.5);
        let rows = self.conic_rows(centre, b, |dy| {
            let w = a * (1.0 - (dy / b).powi(2)).max(0.0).sqrt();
            let shift = shear * dy / b;
            Some((shift - w, shift + w))
        });
        self.draw_rows(canvas, &rows, fill, pen);
    }

    /// Arc (outline), segment or sector of the circle about `centre`
    /// through `start`, running anticlockwise to the direction of `end`
    fn arc(&self, canvas: &mut Canvas, centre: (i32, i32), start: (i32, i32), end: (i32, i32), group: u8, pen: Pen) {
        let r = distance(centre, start);
        if r < 1.0 {
            return;
        }
        let a0 = angle_of(centre, start);
        let a1 = angle_of(centre, end);
        let sweep = (a1 - a0).rem_euclid(std::f64::consts::TAU);
        let within = |gx: f64, gy: f64| {
            let a = gy.atan2(gx);
            (a - a0).rem_euclid(std::f64::consts::TAU) <= sweep
        };
        let rows = self.conic_rows(centre, r, |dy| {
            let w = (r * r - dy * dy).max(0.0).sqrt();
            Some((-w, w))
        });
        let (sx, sy) = (r * a0.cos(), r * a0.sin());
        let (ex, ey) = (r * a1.cos(), r * a1.sin());
        let xunit = (1 << self.xeig) as f64;
        for (y, l, rr) in rows {
            let gy = self.from_py(y) - centre.1 as f64;
            for x in l..=rr {
                let gx = ((x << self.xeig) as f64 + xunit / 2.0) - centre.0 as f64;
                let dist = (gx * gx + gy * gy).sqrt();
                let on_edge = x == l || x == rr;
                let draw = match group {
                    0xA0 => {
                        let ring = dist >= r - xunit.max((1 << self.yeig) as f64) || on_edge;
                        ring && within(gx, gy)
                    }
                    0xB0 => within(gx, gy),
                    _ => {
                        // Segment: the arc lies to the right of the chord start to end
                        (ex - sx) * (gy - sy) - (ey - sy) * (gx - sx) <= 0.0
                    }
                };
                if draw {
                    self.plot_pixel(canvas, x, y, pen);
                }
            }
        }
    }

    /// Move or copy a rectangle of pixels so that its bottom left corner
    /// lands on `to`
    pub fn block_copy(&self, canvas: &mut Canvas, src: Rect, to: (i32, i32), clear_source: bool) {
        let dest_left = self.to_px(to.0);
        let dest_top = self.to_py(to.1) - (src.height() - 1);
        let mut block = Vec::with_capacity((src.width() * src.height()) as usize);
        for y in src.top..=src.bottom {
            for x in src.left..=src.right {
                block.push(canvas.get(x, y));
            }
        }
        if clear_source {
            for y in src.top..=src.bottom {
                self.span(canvas, y, src.left, src.right, Pen { colour: self.bg.colour, action: ACTION_REPLACE });
            }
        }
        let w = src.width();
        for (i, colour) in block.into_iter().enumerate() {
            let Some(colour) = colour else { continue };
            let (dx, dy) = (i as i32 % w, i as i32 / w);
            let (x, y) = (dest_left + dx, dest_top + dy);
            if self.clip.contains(x, y) {
                canvas.put(x, y, colour);
            }
        }
    }

    /// Clear the graphics window to the background colour (VDU 16)
    pub fn clear_window(&self, canvas: &mut Canvas) {
        for y in self.clip.top..=self.clip.bottom {
            self.span(canvas, y, self.clip.left, self.clip.right, self.bg);
        }
    }

    /// Colour number under a point given in user coordinates, -1 if off
    /// the screen or outside the window
    pub fn point(&self, canvas: &Canvas, x: i32, y: i32) -> i32 {
        let (px, py) = (self.to_px(x + self.origin.0), self.to_py(y + self.origin.1));
        if !self.clip.contains(px, py) {
            return -1;
        }
        canvas.get(px, py).map_or(-1, |c| c as i32)
    }
}

fn distance(a: (i32, i32), b: (i32, i32)) -> f64 {
    let (dx, dy) = ((b.0 - a.0) as f64, (b.1 - a.1) as f64);
    (dx * dx + dy * dy).sqrt()
}

fn angle_of(centre: (i32, i32), p: (i32, i32)) -> f64 {
    ((p.1 - centre.1) as f64).atan2((p.0 - centre.0) as f64)
}

/// Pixels on the line between two points, inclusive
pub fn bresenham(from: (i32, i32), to: (i32, i32)) -> Vec<(i32, i32)> {
    let (mut x, mut y) = from;
    let dx = (to.0 - x).abs();
    let dy = -(to.1 - y).abs();
    let sx = if x < to.0 { 1 } else { -1 };
    let sy = if y < to.1 { 1 } else { -1 };
    let mut err = dx + dy;
    let mut points = Vec::with_capacity((dx - dy) as usize + 1);
    loop {
        points.push((x, y));
        if x == to.0 && y == to.1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
    points
}

/// Copy `rect` of the canvas to an RGB surface, mapping colour numbers
/// through `palette` and scaling each pixel to `xscale` by `yscale`
pub fn blit(canvas: &Canvas, rect: Rect, palette: &[u32], xscale: usize, yscale: usize, out: &mut [u32], out_width: usize) {
    let Some(rect) = rect.intersect(canvas.bounds()) else { return };
    let lookup = |c: u32| palette.get(c as usize).copied().unwrap_or(0);
    if xscale == 1 && yscale == 1 && rect == canvas.bounds() && out_width == canvas.width {
        // Whole screen at one to one: straight word copy
        for (dst, &src) in out.iter_mut().zip(canvas.pixels()) {
            *dst = lookup(src);
        }
        return;
    }
    for y in rect.top..=rect.bottom {
        for x in rect.left..=rect.right {
            let Some(colour) = canvas.get(x, y) else { continue };
            let rgb = lookup(colour);
            for sy in 0..yscale {
                let row = (y as usize * yscale + sy) * out_width;
                let start = row + x as usize * xscale;
                if start + xscale <= out.len() {
                    out[start..start + xscale].fill(rgb);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};

    fn setup() -> (Graphics, Canvas) {
        // 640x256 pixels at 2x4 graphics units per pixel, 16 colours
        (Graphics::new(640, 256, 1, 2, 16), Canvas::new(640, 256))
    }

    fn lit(canvas: &Canvas) -> usize {
        canvas.pixels().iter().filter(|&&c| c != 0).count()
    }

    #[test]
    fn test_coordinate_conversion() {
        let (g, _) = setup();
        assert_eq!(g.to_px(0), 0);
        assert_eq!(g.to_py(0), 255);
        assert_eq!(g.to_px(1279), 639);
        assert_eq!(g.to_py(1023), 0);
        assert_eq!(g.units(), (1280, 1024));
    }

    #[test]
    fn test_move_and_draw() {
        let (mut g, mut c) = setup();
        g.plot(&mut c, 4, 0, 0).unwrap();
        assert_eq!(lit(&c), 0);
        g.plot(&mut c, 5, 20, 0).unwrap();
        assert_eq!(lit(&c), 11);
        assert_eq!(c.get(10, 255), Some(15));
        assert_eq!(g.cursor(), (20, 0));
    }

    #[test]
    fn test_line_without_last_point() {
        let (mut g, mut c) = setup();
        g.plot(&mut c, 4, 0, 0).unwrap();
        g.plot(&mut c, 13, 20, 0).unwrap();
        assert_eq!(lit(&c), 10);
        assert_eq!(c.get(10, 255), Some(0));
    }

    #[test]
    fn test_dotted_line() {
        let (mut g, mut c) = setup();
        g.plot(&mut c, 4, 0, 0).unwrap();
        g.plot(&mut c, 21, 30, 0).unwrap();
        // Pattern 10101010: every other pixel of 16
        assert_eq!(lit(&c), 8);
    }

    #[test]
    fn test_clipping() {
        let (mut g, mut c) = setup();
        g.set_window(0, 0, 100, 100).unwrap();
        g.plot(&mut c, 4, 0, 0).unwrap();
        g.plot(&mut c, 5, 400, 400).unwrap();
        for (i, &p) in c.pixels().iter().enumerate() {
            if p != 0 {
                let (x, y) = ((i % 640) as i32, (i / 640) as i32);
                assert!(g.clip.contains(x, y));
            }
        }
        assert!(lit(&c) > 0);
    }

    #[test]
    fn test_triangle_and_rectangle_fill() {
        let (mut g, mut c) = setup();
        g.plot(&mut c, 4, 0, 0).unwrap();
        g.plot(&mut c, 4, 100, 0).unwrap();
        g.plot(&mut c, 85, 0, 100).unwrap();
        let triangle = lit(&c);
        assert!(triangle > 100);
        c.clear(0);
        g.plot(&mut c, 4, 0, 0).unwrap();
        g.plot(&mut c, 101, 19, 39).unwrap();
        assert_eq!(lit(&c), 10 * 10);
    }

    #[test]
    fn test_flood_fill_inside_box() {
        let (mut g, mut c) = setup();
        for (code, x, y) in [(4, 0, 0), (5, 100, 0), (5, 100, 100), (5, 0, 100), (5, 0, 0)] {
            g.plot(&mut c, code, x, y).unwrap();
        }
        let outline = lit(&c);
        g.fg.colour = 2;
        g.plot(&mut c, 133, 50, 50).unwrap();
        let filled = c.pixels().iter().filter(|&&p| p == 2).count();
        assert!(filled > 0);
        assert_eq!(lit(&c), outline + filled);
        assert_eq!(c.get(200, 10), Some(0));
    }

    #[test]
    fn test_circle_is_symmetric() {
        let (mut g, mut c) = setup();
        g.plot(&mut c, 4, 640, 512).unwrap();
        g.plot(&mut c, 153, 200, 0).unwrap();
        let cx = 320;
        let cy = g.to_py(512);
        assert_eq!(c.get(cx, cy), Some(15));
        assert_eq!(c.get(cx + 90, cy), Some(15));
        assert_eq!(c.get(cx - 90, cy), Some(15));
        assert_eq!(c.get(cx + 150, cy), Some(0));
    }

    #[test]
    fn test_block_copy() {
        let (mut g, mut c) = setup();
        c.put(0, 255, 3);
        g.visit(0, 0);
        g.visit(10, 10);
        g.plot(&mut c, 190, 100, 0).unwrap();
        assert_eq!(c.get(50, 255), Some(3));
        assert_eq!(c.get(0, 255), Some(3));
    }

    #[test]
    fn test_bad_plot_code() {
        let (mut g, mut c) = setup();
        assert_eq!(g.plot(&mut c, 0xD5, 0, 0).unwrap_err().kind, ErrorKind::BadPlot);
    }

    #[test]
    fn test_blit_scales() {
        let mut c = Canvas::new(2, 1);
        c.put(1, 0, 1);
        let palette = [0x000000, 0xFFFFFF];
        let mut out = vec![0u32; 4 * 2];
        blit(&c, c.bounds(), &palette, 2, 2, &mut out, 4);
        assert_eq!(out, vec![0, 0, 0xFFFFFF, 0xFFFFFF, 0, 0, 0xFFFFFF, 0xFFFFFF]);
    }

    #[test]
    fn test_eor_twice_is_identity() {
        fn prop(seed: Vec<u8>, colour: u8, x: u16, y: u16) -> TestResult {
            let (mut g, mut c) = setup();
            for (i, b) in seed.iter().enumerate().take(64) {
                c.put(i as i32 * 7 % 640, i as i32 % 256, (*b & 15) as u32);
            }
            let before = c.pixels().to_vec();
            g.fg = Pen { colour: (colour & 15) as u32, action: ACTION_EOR };
            let (x, y) = ((x % 1280) as i32, (y % 1024) as i32);
            g.plot(&mut c, 69, x, y).unwrap();
            g.plot(&mut c, 69, x, y).unwrap();
            TestResult::from_bool(c.pixels() == &before[..])
        }
        QuickCheck::new()
            .tests(50)
            .quickcheck(prop as fn(Vec<u8>, u8, u16, u16) -> TestResult);
    }
}
