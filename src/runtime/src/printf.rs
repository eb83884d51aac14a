//! Host-side replay of device printf buffers.
//!
//! A kernel with printf calls gets a 1 MiB buffer bound as a UAV; the
//! device appends `(format_id, packed args)` records to it. After the task
//! completes, the runtime maps the buffer and re-parses each format string,
//! expanding the packed arguments. The parser supports flags, field width,
//! precision, `h`/`hh`/`l`/`hl` length modifiers, and `v2/3/4/8/16` vector
//! prefixes.

use crate::compiler::PrintfInfo;

use std::io::Write;

/// Size of the device-side printf buffer.
pub const PRINTF_BUFFER_SIZE: u32 = 1024 * 1024;

/// Bytes of header before the first record: `{ next_write_offset,
/// total_size }`.
pub const PRINTF_HEADER_SIZE: u32 = 8;

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let quad = bytes.get(at..at + 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(quad);
    Some(u32::from_le_bytes(raw))
}

fn align4(value: u32) -> u32 {
    (value + 3) & !3
}

#[derive(Default)]
struct ConversionSpec {
    minus: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl ConversionSpec {
    fn pad(&self, body: String, negative_sign_done: bool) -> String {
        let _ = negative_sign_done;
        if body.len() >= self.width {
            return body;
        }
        let fill = self.width - body.len();
        if self.minus {
            let mut out = body;
            out.extend(std::iter::repeat(' ').take(fill));
            out
        } else {
            let mut out: String = std::iter::repeat(' ').take(fill).collect();
            out.push_str(&body);
            out
        }
    }

    fn sign_prefix(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    fn format_signed(&self, value: i64) -> String {
        let negative = value < 0;
        let magnitude = value.unsigned_abs().to_string();
        self.finish_int(magnitude, self.sign_prefix(negative), "")
    }

    fn format_unsigned(&self, value: u64, base: u32, upper: bool) -> String {
        let magnitude = match base {
            8 => format!("{:o}", value),
            16 if upper => format!("{:X}", value),
            16 => format!("{:x}", value),
            _ => value.to_string(),
        };
        let prefix = if self.alt && value != 0 {
            match base {
                8 => "0",
                16 if upper => "0X",
                16 => "0x",
                _ => "",
            }
        } else {
            ""
        };
        self.finish_int(magnitude, "", prefix)
    }

    fn finish_int(&self, mut magnitude: String, sign: &str, prefix: &str) -> String {
        if let Some(precision) = self.precision {
            while magnitude.len() < precision {
                magnitude.insert(0, '0');
            }
        } else if self.zero && !self.minus {
            let fixed = sign.len() + prefix.len();
            while fixed + magnitude.len() < self.width {
                magnitude.insert(0, '0');
            }
        }
        self.pad(format!("{}{}{}", sign, prefix, magnitude), true)
    }

    fn format_float(&self, value: f64, conv: char) -> String {
        let precision = self.precision.unwrap_or(6);
        let negative = value.is_sign_negative() && !value.is_nan();
        let magnitude = value.abs();
        let body = match conv {
            'f' | 'F' => format!("{:.*}", precision, magnitude),
            'e' | 'E' => {
                let formatted = format!("{:.*e}", precision, magnitude);
                // Rust renders `1e2`; C wants `1.000000e+02`.
                let formatted = match formatted.split_once('e') {
                    Some((mantissa, exp)) => {
                        let exp: i32 = exp.parse().unwrap_or(0);
                        format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
                    }
                    None => formatted,
                };
                if conv == 'E' {
                    formatted.to_uppercase()
                } else {
                    formatted
                }
            }
            'g' | 'G' => {
                let exp = if magnitude == 0.0 {
                    0
                } else {
                    magnitude.log10().floor() as i32
                };
                let precision = precision.max(1);
                if exp < -4 || exp >= precision as i32 {
                    let s = self.format_float_body_e(magnitude, precision - 1);
                    if conv == 'G' {
                        s.to_uppercase()
                    } else {
                        s
                    }
                } else {
                    let decimals = (precision as i32 - 1 - exp).max(0) as usize;
                    let mut s = format!("{:.*}", decimals, magnitude);
                    if s.contains('.') {
                        while s.ends_with('0') {
                            s.pop();
                        }
                        if s.ends_with('.') {
                            s.pop();
                        }
                    }
                    s
                }
            }
            'a' | 'A' => {
                let s = format_hex_float(magnitude);
                if conv == 'A' {
                    s.to_uppercase()
                } else {
                    s
                }
            }
            _ => format!("{}", magnitude),
        };
        let sign = self.sign_prefix(negative);
        let mut body = body;
        if self.zero && !self.minus && sign.len() + body.len() < self.width {
            let fill = self.width - sign.len() - body.len();
            let mut padded: String = std::iter::repeat('0').take(fill).collect();
            padded.push_str(&body);
            body = padded;
        }
        self.pad(format!("{}{}", sign, body), true)
    }

    fn format_float_body_e(&self, magnitude: f64, precision: usize) -> String {
        let formatted = format!("{:.*e}", precision, magnitude);
        match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let exp: i32 = exp.parse().unwrap_or(0);
                format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs())
            }
            None => formatted,
        }
    }

    fn format_string(&self, value: &str) -> String {
        let truncated = match self.precision {
            Some(precision) if precision < value.len() => &value[..precision],
            _ => value,
        };
        self.pad(truncated.to_string(), true)
    }
}

fn format_hex_float(value: f64) -> String {
    if value == 0.0 {
        return "0x0p+0".to_string();
    }
    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i64 - 1023;
    let mantissa = bits & 0xf_ffff_ffff_ffff;
    let mut hex = format!("{:013x}", mantissa);
    while hex.ends_with('0') && hex.len() > 1 {
        hex.pop();
    }
    if mantissa == 0 {
        format!("0x1p{}{}", if exponent < 0 { '-' } else { '+' }, exponent.abs())
    } else {
        format!(
            "0x1.{}p{}{}",
            hex,
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    }
}

struct ArgReader<'a> {
    bytes: &'a [u8],
    struct_begin: u32,
    offset_in_struct: u32,
}

impl<'a> ArgReader<'a> {
    fn take(&mut self, size: u32) -> Option<&'a [u8]> {
        let at = align4(self.offset_in_struct) + self.struct_begin;
        self.offset_in_struct = align4(self.offset_in_struct) + size;
        self.bytes.get(at as usize..(at + size) as usize)
    }
}

fn read_scalar_u64(raw: &[u8], size: u32) -> u64 {
    let mut quad = [0u8; 8];
    quad[..size as usize].copy_from_slice(&raw[..size as usize]);
    u64::from_le_bytes(quad)
}

fn read_scalar_i64(raw: &[u8], size: u32) -> i64 {
    let unsigned = read_scalar_u64(raw, size);
    match size {
        1 => unsigned as u8 as i8 as i64,
        2 => unsigned as u16 as i16 as i64,
        4 => unsigned as u32 as i32 as i64,
        _ => unsigned as i64,
    }
}

/// Expand every record of a printf buffer to `out`.
///
/// `buffer` is the full mapped contents including the header; `formats` is
/// the kernel's format table. Malformed records terminate processing, the
/// way a device-side overflow would.
pub fn process_printf_buffer(
    buffer: &[u8],
    formats: &[PrintfInfo],
    out: &mut dyn Write,
) -> std::io::Result<()> {
    let written = match read_u32(buffer, 0) {
        Some(written) => written,
        None => return Ok(()),
    };
    let mut cursor = PRINTF_HEADER_SIZE;

    while cursor < written && (cursor as usize) < buffer.len() {
        let format_id = match read_u32(buffer, cursor as usize) {
            Some(id) => id,
            None => break,
        };
        if format_id == 0 || format_id as usize > formats.len() {
            break;
        }
        let info = &formats[format_id as usize - 1];
        cursor += 4;

        let total_args: u32 = align4(info.arg_sizes.iter().sum());
        if cursor + total_args > buffer.len() as u32 {
            break;
        }

        let mut reader = ArgReader {
            bytes: buffer,
            struct_begin: cursor,
            offset_in_struct: 0,
        };
        expand_record(info, &mut reader, out)?;
        cursor += total_args;
    }
    out.flush()
}

fn expand_record(
    info: &PrintfInfo,
    reader: &mut ArgReader,
    out: &mut dyn Write,
) -> std::io::Result<()> {
    let format = info.format.as_bytes();
    let mut at = 0usize;
    let mut arg_index = 0usize;

    while at < format.len() {
        // The format string doubles as the string table; stop at its
        // terminator.
        if format[at] == 0 {
            break;
        }
        if format[at] != b'%' {
            out.write_all(&format[at..at + 1])?;
            at += 1;
            continue;
        }
        if format.get(at + 1) == Some(&b'%') {
            out.write_all(b"%")?;
            at += 2;
            continue;
        }
        at += 1;

        let mut spec = ConversionSpec::default();
        // Flags.
        loop {
            match format.get(at) {
                Some(b'-') => spec.minus = true,
                Some(b'+') => spec.plus = true,
                Some(b' ') => spec.space = true,
                Some(b'#') => spec.alt = true,
                Some(b'0') => spec.zero = true,
                _ => break,
            }
            at += 1;
        }
        // Field width.
        while let Some(c) = format.get(at).filter(|c| c.is_ascii_digit()) {
            spec.width = spec.width * 10 + usize::from(c - b'0');
            at += 1;
        }
        // Precision.
        if format.get(at) == Some(&b'.') {
            at += 1;
            let mut precision = 0usize;
            while let Some(c) = format.get(at).filter(|c| c.is_ascii_digit()) {
                precision = precision * 10 + usize::from(c - b'0');
                at += 1;
            }
            spec.precision = Some(precision);
        }

        // Vector prefix.
        let mut vector_size = 1u32;
        if format.get(at) == Some(&b'v') {
            at += 1;
            vector_size = match format.get(at) {
                Some(b'2') => 2,
                Some(b'3') => 3,
                Some(b'4') => 4,
                Some(b'8') => 8,
                Some(b'1') if format.get(at + 1) == Some(&b'6') => {
                    at += 1;
                    16
                }
                _ => {
                    write!(out, "<invalid vector size in printf format>")?;
                    return Ok(());
                }
            };
            at += 1;
        }

        // Length modifier.
        let mut data_size = 4u32;
        let mut explicit_size = false;
        match format.get(at) {
            Some(b'h') => {
                explicit_size = true;
                at += 1;
                if format.get(at) == Some(&b'h') {
                    data_size = 1;
                    at += 1;
                } else if format.get(at) == Some(&b'l') {
                    if vector_size == 1 {
                        write!(out, "<hl requires a vector in printf format>")?;
                        return Ok(());
                    }
                    data_size = 4;
                    at += 1;
                } else {
                    data_size = 2;
                }
            }
            Some(b'l') => {
                explicit_size = true;
                data_size = 8;
                at += 1;
            }
            _ => {}
        }

        if !explicit_size && vector_size > 1 {
            write!(out, "<vector printf requires explicit element size>")?;
            return Ok(());
        }

        let conv = match format.get(at) {
            Some(&c) => c as char,
            None => break,
        };
        at += 1;

        if !explicit_size && (conv == 's' || conv == 'p') {
            data_size = 8;
        }
        if conv == 'c' {
            data_size = if explicit_size { data_size } else { 4 };
        }

        let stored = data_size * if vector_size == 3 { 4 } else { vector_size };
        debug_assert!(
            arg_index >= info.arg_sizes.len() || stored == info.arg_sizes[arg_index],
            "printf metadata disagrees with format string"
        );
        let raw = match reader.take(stored) {
            Some(raw) => raw,
            None => break,
        };
        arg_index += 1;

        for lane in 0..vector_size {
            let element = &raw[(lane * data_size) as usize..];
            let text = match conv {
                'd' | 'i' => spec.format_signed(read_scalar_i64(element, data_size)),
                'u' => spec.format_unsigned(read_scalar_u64(element, data_size), 10, false),
                'o' => spec.format_unsigned(read_scalar_u64(element, data_size), 8, false),
                'x' => spec.format_unsigned(read_scalar_u64(element, data_size), 16, false),
                'X' => spec.format_unsigned(read_scalar_u64(element, data_size), 16, true),
                'p' => format!("0x{:x}", read_scalar_u64(element, 8)),
                'c' => {
                    let value = read_scalar_u64(element, data_size.min(4)) as u8;
                    spec.format_string(&(value as char).to_string())
                }
                'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A' => {
                    if explicit_size && data_size != 4 {
                        write!(out, "<only 4-byte floats are supported by printf>")?;
                        return Ok(());
                    }
                    let bits = read_scalar_u64(element, 4) as u32;
                    spec.format_float(f64::from(f32::from_bits(bits)), conv)
                }
                's' => {
                    let table_offset = read_scalar_u64(element, 8) as usize;
                    let table = info.format.as_bytes();
                    let tail = table.get(table_offset..).unwrap_or(&[]);
                    let end = tail.iter().position(|&c| c == 0).unwrap_or(tail.len());
                    spec.format_string(&String::from_utf8_lossy(&tail[..end]))
                }
                _ => {
                    write!(out, "<unknown printf conversion '{}'>", conv)?;
                    return Ok(());
                }
            };
            out.write_all(text.as_bytes())?;
            if lane + 1 < vector_size {
                out.write_all(b",")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(format: &str, arg_sizes: &[u32], payload: &[u8]) -> String {
        let info = PrintfInfo {
            format: format.to_string(),
            arg_sizes: arg_sizes.to_vec(),
        };
        let mut buffer = Vec::new();
        let record_len = 4 + align4(arg_sizes.iter().sum());
        buffer.extend_from_slice(&(PRINTF_HEADER_SIZE + record_len).to_le_bytes());
        buffer.extend_from_slice(&PRINTF_BUFFER_SIZE.to_le_bytes());
        buffer.extend_from_slice(&1u32.to_le_bytes());
        buffer.extend_from_slice(payload);
        while buffer.len() % 4 != 0 {
            buffer.push(0);
        }
        let mut out = Vec::new();
        process_printf_buffer(&buffer, std::slice::from_ref(&info), &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn plain_integers() {
        assert_eq!(run("x=%d\n", &[4], &(-42i32).to_le_bytes()), "x=-42\n");
        assert_eq!(run("x=%u", &[4], &7u32.to_le_bytes()), "x=7");
        assert_eq!(run("x=%#x", &[4], &255u32.to_le_bytes()), "x=0xff");
    }

    #[test]
    fn width_and_flags() {
        assert_eq!(run("[%5d]", &[4], &42u32.to_le_bytes()), "[   42]");
        assert_eq!(run("[%-5d]", &[4], &42u32.to_le_bytes()), "[42   ]");
        assert_eq!(run("[%05d]", &[4], &42u32.to_le_bytes()), "[00042]");
        assert_eq!(run("[%+d]", &[4], &42u32.to_le_bytes()), "[+42]");
    }

    #[test]
    fn length_modifiers() {
        assert_eq!(
            run("%ld", &[8], &(-1i64).to_le_bytes()),
            "-1"
        );
        assert_eq!(run("%hd", &[2], &(-1i16).to_le_bytes()), "-1");
    }

    #[test]
    fn vectors_are_comma_separated() {
        let mut payload = Vec::new();
        for v in [1u32, 2, 3, 4] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(run("%v4hld", &[16], &payload), "1,2,3,4");
    }

    #[test]
    fn floats() {
        assert_eq!(run("%f", &[4], &1.5f32.to_le_bytes()), "1.500000");
        assert_eq!(run("%.1f", &[4], &1.25f32.to_le_bytes()), "1.2");
        assert_eq!(run("%e", &[4], &1500.0f32.to_le_bytes()), "1.500000e+03");
    }

    #[test]
    fn percent_escape() {
        assert_eq!(run("100%%", &[], &[]), "100%");
    }

    #[test]
    fn string_from_table() {
        // Format string doubles as the string table: "%s\0world\0".
        let format = "%s\0world\0";
        let payload = 3u64.to_le_bytes(); // offset of "world"
        assert_eq!(run(format, &[8], &payload), "world");
    }

    #[test]
    fn truncated_record_stops_processing() {
        let info = PrintfInfo {
            format: "%d".to_string(),
            arg_sizes: vec![4],
        };
        // Header claims more bytes than present.
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&1000u32.to_le_bytes());
        buffer.extend_from_slice(&PRINTF_BUFFER_SIZE.to_le_bytes());
        buffer.extend_from_slice(&1u32.to_le_bytes());
        let mut out = Vec::new();
        process_printf_buffer(&buffer, &[info], &mut out).unwrap();
        assert!(out.is_empty());
    }
}
