//! Bounds-checked readers over raw byte buffers.
//!
//! Every reader returns `None` instead of reading past the end of `data`,
//! including when `offset + width` overflows.

fn field<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    data.get(offset..end)?.try_into().ok()
}

// little-endian u16
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    field::<2>(data, offset).map(u16::from_le_bytes)
}

// little-endian u32
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    field::<4>(data, offset).map(u32::from_le_bytes)
}

pub fn read_u32_as_usize(data: &[u8], offset: usize) -> Option<usize> {
    read_u32(data, offset).map(|v| v as usize)
}

// little-endian i32
pub fn read_i32(data: &[u8], offset: usize) -> Option<i32> {
    field::<4>(data, offset).map(i32::from_le_bytes)
}

// little-endian u64
pub fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    field::<8>(data, offset).map(u64::from_le_bytes)
}

/// Decode a UTF-16LE string of `len` bytes at `offset`, stopping at the first NUL.
pub fn read_utf16z(data: &[u8], offset: usize, len: usize) -> Option<String> {
    let end = offset.checked_add(len)?;
    let raw = data.get(offset..end)?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    Some(String::from_utf16_lossy(&units))
}

/// Convert 100-nanosecond ticks to milliseconds.
pub fn ticks_to_ms(ticks: u64) -> u64 {
    ticks / 10_000
}

/// Split a UTF-16 buffer of NUL-separated strings, ending at the first empty one.
pub fn split_multi_sz(units: &[u16]) -> Vec<String> {
    units
        .split(|&u| u == 0)
        .take_while(|s| !s.is_empty())
        .map(String::from_utf16_lossy)
        .collect()
}

/// Split a command line into arguments with the C runtime's quoting rules.
///
/// Whitespace outside double quotes separates arguments. `2n` backslashes
/// before a quote become `n` backslashes and the quote toggles quoting;
/// `2n + 1` backslashes become `n` backslashes and a literal quote.
/// Backslashes anywhere else are literal.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quoted = false;
    let mut backslashes = 0usize;

    for c in line.chars() {
        if c == '\\' {
            backslashes += 1;
            in_arg = true;
            continue;
        }

        if c == '"' {
            current.extend(std::iter::repeat('\\').take(backslashes / 2));
            if backslashes % 2 == 1 {
                current.push('"');
            } else {
                quoted = !quoted;
            }
            backslashes = 0;
            in_arg = true;
            continue;
        }

        current.extend(std::iter::repeat('\\').take(backslashes));
        backslashes = 0;

        if (c == ' ' || c == '\t') && !quoted {
            if in_arg {
                args.push(std::mem::take(&mut current));
                in_arg = false;
            }
        } else {
            current.push(c);
            in_arg = true;
        }
    }

    current.extend(std::iter::repeat('\\').take(backslashes));
    if in_arg {
        args.push(current);
    }
    args
}
