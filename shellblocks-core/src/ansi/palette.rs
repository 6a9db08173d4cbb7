//! 16-color foreground palette (8 standard + 8 bright), one column per theme.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

pub const PALETTE_SIZE: usize = 16;

/// `[light, dark]` per index. Light variants are darkened to stay readable
/// on a white background.
const PALETTE: [[Rgb; 2]; PALETTE_SIZE] = [
    // standard
    [Rgb(0x00, 0x00, 0x00), Rgb(0x1e, 0x1e, 0x1e)], // black
    [Rgb(0xb2, 0x1b, 0x1b), Rgb(0xe0, 0x5a, 0x5a)], // red
    [Rgb(0x1a, 0x7f, 0x37), Rgb(0x6a, 0xc7, 0x6a)], // green
    [Rgb(0x8a, 0x6d, 0x00), Rgb(0xe5, 0xc0, 0x7b)], // yellow
    [Rgb(0x1f, 0x4f, 0xb5), Rgb(0x61, 0xaf, 0xef)], // blue
    [Rgb(0x8e, 0x2d, 0x9b), Rgb(0xc6, 0x78, 0xdd)], // magenta
    [Rgb(0x0b, 0x73, 0x80), Rgb(0x56, 0xb6, 0xc2)], // cyan
    [Rgb(0x6e, 0x6e, 0x6e), Rgb(0xc8, 0xc8, 0xc8)], // white
    // bright
    [Rgb(0x4d, 0x4d, 0x4d), Rgb(0x7f, 0x84, 0x8e)], // bright black
    [Rgb(0xd7, 0x3a, 0x49), Rgb(0xff, 0x6b, 0x6b)], // bright red
    [Rgb(0x22, 0x86, 0x3a), Rgb(0x98, 0xe0, 0x98)], // bright green
    [Rgb(0xb0, 0x88, 0x00), Rgb(0xff, 0xe0, 0x8a)], // bright yellow
    [Rgb(0x03, 0x66, 0xd6), Rgb(0x8c, 0xc8, 0xff)], // bright blue
    [Rgb(0xa3, 0x3e, 0xb5), Rgb(0xe0, 0x9e, 0xf5)], // bright magenta
    [Rgb(0x1b, 0x90, 0x9c), Rgb(0x8a, 0xe6, 0xf0)], // bright cyan
    [Rgb(0x24, 0x29, 0x2e), Rgb(0xff, 0xff, 0xff)], // bright white
];

/// Resolve a palette index for a theme. Out-of-range indices have no color.
pub fn color(index: u8, theme: Theme) -> Option<Rgb> {
    let row = PALETTE.get(index as usize)?;
    Some(match theme {
        Theme::Light => row[0],
        Theme::Dark => row[1],
    })
}
