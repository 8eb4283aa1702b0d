/**
 * Pixels with an alpha value below this are treated as fully transparent.
 */
pub const ALPHA_THRESHOLD: u8 = 128;

/// The four inks of the panel. The discriminant is the 2-bit code written
/// into the frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Colour {
    Black = 0,
    White = 1,
    Yellow = 2,
    Red = 3,
}

// Declaration order matters: ties go to the earlier entry.
const PALETTE: [Colour; 4] = [Colour::White, Colour::Black, Colour::Red, Colour::Yellow];

impl Colour {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Colour {
        match code & 0b11 {
            0 => Colour::Black,
            1 => Colour::White,
            2 => Colour::Yellow,
            _ => Colour::Red,
        }
    }

    pub fn rgb(self) -> [u8; 3] {
        match self {
            Colour::White => [255, 255, 255],
            Colour::Black => [0, 0, 0],
            Colour::Red => [255, 0, 0],
            Colour::Yellow => [255, 220, 0],
        }
    }
}

fn distance(rgb: [u8; 3], colour: Colour) -> u32 {
    rgb.iter()
        .zip(colour.rgb().iter())
        .map(|(a, b)| {
            let d = *a as i32 - *b as i32;
            (d * d) as u32
        })
        .sum()
}

/// Maps an RGBA pixel to the nearest palette entry by squared euclidean
/// distance in RGB space.
pub fn quantise(r: u8, g: u8, b: u8, a: u8) -> Colour {
    if a < ALPHA_THRESHOLD {
        return Colour::White;
    }

    let rgb = [r, g, b];
    let mut best = PALETTE[0];
    let mut best_distance = distance(rgb, best);

    for colour in &PALETTE[1..] {
        let d = distance(rgb, *colour);
        if d < best_distance {
            best = *colour;
            best_distance = d;
        }
    }

    best
}
