//! Aux tag lookup.

/// Size in bytes of a tag value of type `val_type` starting at `data`, or `None` if the type
/// is unknown or the value is truncated.
#[must_use]
pub fn tag_value_size(val_type: u8, data: &[u8]) -> Option<usize> {
    let fixed = |t: u8| match t {
        b'A' | b'c' | b'C' => Some(1),
        b's' | b'S' => Some(2),
        b'i' | b'I' | b'f' => Some(4),
        _ => None,
    };
    if let Some(size) = fixed(val_type) {
        return Some(size);
    }
    match val_type {
        b'Z' | b'H' => Some(data.iter().position(|&b| b == 0)? + 1),
        b'B' => {
            if data.len() < 5 {
                return None;
            }
            let count = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
            Some(5 + count * fixed(data[0])?)
        }
        _ => None,
    }
}

/// Locate `tag` in aux data, returning its type byte and value bytes.
#[must_use]
pub fn find_tag<'a>(aux: &'a [u8], tag: &[u8; 2]) -> Option<(u8, &'a [u8])> {
    let mut p = 0;
    while p + 3 <= aux.len() {
        let val_type = aux[p + 2];
        let size = tag_value_size(val_type, &aux[p + 3..])?;
        if p + 3 + size > aux.len() {
            return None;
        }
        if &aux[p..p + 2] == tag {
            return Some((val_type, &aux[p + 3..p + 3 + size]));
        }
        p += 3 + size;
    }
    None
}

/// Value of a `Z`-typed tag without its NUL terminator.
#[must_use]
pub fn find_string_tag<'a>(aux: &'a [u8], tag: &[u8; 2]) -> Option<&'a [u8]> {
    match find_tag(aux, tag)? {
        (b'Z', value) => Some(&value[..value.len() - 1]),
        _ => None,
    }
}

/// Value of any integer-typed tag widened to `i64`.
#[must_use]
pub fn find_int_tag(aux: &[u8], tag: &[u8; 2]) -> Option<i64> {
    let (t, v) = find_tag(aux, tag)?;
    Some(match t {
        b'c' => i64::from(v[0] as i8),
        b'C' => i64::from(v[0]),
        b's' => i64::from(i16::from_le_bytes([v[0], v[1]])),
        b'S' => i64::from(u16::from_le_bytes([v[0], v[1]])),
        b'i' => i64::from(i32::from_le_bytes([v[0], v[1], v[2], v[3]])),
        b'I' => i64::from(u32::from_le_bytes([v[0], v[1], v[2], v[3]])),
        _ => return None,
    })
}
