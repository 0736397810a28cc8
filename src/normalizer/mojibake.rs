//! Repair of UTF-8 text that was decoded as Latin-1 or Windows-1252.

use std::borrow::Cow;

/// Windows-1252 glyphs in the 0x80..=0x9F range. Unassigned slots are absent
/// and fall through to the Latin-1 C1 control of the same value.
const CP1252_HIGH: [(char, u8); 27] = [
    ('\u{20AC}', 0x80),
    ('\u{201A}', 0x82),
    ('\u{0192}', 0x83),
    ('\u{201E}', 0x84),
    ('\u{2026}', 0x85),
    ('\u{2020}', 0x86),
    ('\u{2021}', 0x87),
    ('\u{02C6}', 0x88),
    ('\u{2030}', 0x89),
    ('\u{0160}', 0x8A),
    ('\u{2039}', 0x8B),
    ('\u{0152}', 0x8C),
    ('\u{017D}', 0x8E),
    ('\u{2018}', 0x91),
    ('\u{2019}', 0x92),
    ('\u{201C}', 0x93),
    ('\u{201D}', 0x94),
    ('\u{2022}', 0x95),
    ('\u{2013}', 0x96),
    ('\u{2014}', 0x97),
    ('\u{02DC}', 0x98),
    ('\u{2122}', 0x99),
    ('\u{0161}', 0x9A),
    ('\u{203A}', 0x9B),
    ('\u{0153}', 0x9C),
    ('\u{017E}', 0x9E),
    ('\u{0178}', 0x9F),
];

pub fn has_cyrillic(text: &str) -> bool {
    text.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c))
}

fn latin1_byte(c: char) -> Option<u8> {
    u8::try_from(u32::from(c)).ok()
}

fn cp1252_byte(c: char) -> Option<u8> {
    latin1_byte(c).or_else(|| {
        CP1252_HIGH
            .iter()
            .find(|(glyph, _)| *glyph == c)
            .map(|(_, byte)| *byte)
    })
}

fn reencode(text: &str, to_byte: fn(char) -> Option<u8>) -> Option<String> {
    let bytes = text.chars().map(to_byte).collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// One repair step: Latin-1 first, then Windows-1252.
fn redecode(text: &str) -> Option<String> {
    reencode(text, latin1_byte).or_else(|| reencode(text, cp1252_byte))
}

/// Repair mojibake.
///
/// Text that already contains Cyrillic, or is plain ASCII, is returned as is.
/// Otherwise the text is re-encoded and decoded as UTF-8 until that stops
/// succeeding, which also undoes double encoding. Every successful step
/// strictly shortens the text, so the loop ends, and the result is a fixed
/// point of the function.
pub fn repair(text: &str) -> Cow<'_, str> {
    let mut current = Cow::Borrowed(text);
    loop {
        if current.is_ascii() || has_cyrillic(&current) {
            return current;
        }
        match redecode(&current) {
            Some(next) => current = Cow::Owned(next),
            None => return current,
        }
    }
}
