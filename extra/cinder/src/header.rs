//! Compiled-module parsing.
//!
//! The compiler prefixes every SPIR-V binary with a little-endian word
//! header describing the buffer bindings of each entry point:
//!
//! ```text
//! [0] header_word_count + 1
//! [1] entry_point_count N
//! repeat N times:
//!   [0] uniform_buffer_count
//!   [1] storage_buffer_count
//!   [2] padded_name_length (bytes, multiple of 4)
//!   [3..] UTF-8 name, null-terminated, zero-padded
//! ```
//!
//! The header MUST be consumed first; the remaining words are handed to
//! the SPIR-V loader verbatim.

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointLayout {
    pub name: String,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
}

impl EntryPointLayout {
    pub fn binding_count(&self) -> u32 {
        self.uniform_buffer_count + self.storage_buffer_count
    }
}

#[derive(Debug, Clone)]
pub struct ParsedModule {
    pub entry_points: Vec<EntryPointLayout>,
    /// The SPIR-V body, starting at the magic number.
    pub spirv: Vec<u32>,
}

const SPIRV_MAGIC: u32 = 0x0723_0203;

fn bad(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::BadModule(msg.into())
}

pub fn parse_module(bytes: &[u8]) -> Result<ParsedModule> {
    if bytes.len() % 4 != 0 {
        return Err(bad(format!(
            "module size {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let header_len = *words.first().ok_or_else(|| bad("empty module"))? as usize;
    if header_len < 2 || header_len > words.len() {
        return Err(bad(format!("corrupt header length {}", header_len)));
    }

    let mut pos = 1usize;
    let mut next = |what: &str| -> Result<u32> {
        if pos >= header_len {
            return Err(bad(format!("truncated header reading {}", what)));
        }
        let w = words[pos];
        pos += 1;
        Ok(w)
    };

    let count = next("entry point count")?;
    let mut entry_points = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let uniform_buffer_count = next("uniform buffer count")?;
        let storage_buffer_count = next("storage buffer count")?;
        let padded = next("name length")? as usize;
        if padded % 4 != 0 {
            return Err(bad("entry point name length is not word-aligned"));
        }
        let mut name_bytes = Vec::with_capacity(padded);
        for _ in 0..padded / 4 {
            name_bytes.extend_from_slice(&next("entry point name")?.to_le_bytes());
        }
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| bad("entry point name missing null terminator"))?;
        let name = std::str::from_utf8(&name_bytes[..end])
            .map_err(|_| bad("entry point name is not UTF-8"))?
            .to_string();
        entry_points.push(EntryPointLayout {
            name,
            uniform_buffer_count,
            storage_buffer_count,
        });
    }
    if pos != header_len {
        return Err(bad("header shorter than declared"));
    }

    let spirv = words[header_len..].to_vec();
    match spirv.first() {
        Some(&SPIRV_MAGIC) => {}
        _ => return Err(bad("body does not start with the SPIR-V magic number")),
    }
    Ok(ParsedModule {
        entry_points,
        spirv,
    })
}

/// A content fingerprint of a module, used as the compilation-cache key.
pub fn fingerprint(bytes: &[u8]) -> u64 {
    // FNV-1a: cheap and stable; collisions only cost a redundant rebuild
    // check, never incorrect reuse (the cache stores the bytes' length).
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash ^ (bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(entries: &[(&str, u32, u32)], body: &[u32]) -> Vec<u8> {
        let mut words = vec![entries.len() as u32];
        for (name, ub, sb) in entries {
            let mut name_bytes = name.as_bytes().to_vec();
            name_bytes.push(0);
            while name_bytes.len() % 4 != 0 {
                name_bytes.push(0);
            }
            words.push(*ub);
            words.push(*sb);
            words.push(name_bytes.len() as u32);
            for c in name_bytes.chunks_exact(4) {
                words.push(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            }
        }
        words.insert(0, words.len() as u32 + 1);
        words.extend_from_slice(body);
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_single_entry() {
        let bytes = module_bytes(&[("f", 0, 1)], &[SPIRV_MAGIC, 0x10200, 0, 8, 0]);
        let parsed = parse_module(&bytes).unwrap();
        assert_eq!(parsed.entry_points.len(), 1);
        assert_eq!(parsed.entry_points[0].name, "f");
        assert_eq!(parsed.entry_points[0].uniform_buffer_count, 0);
        assert_eq!(parsed.entry_points[0].storage_buffer_count, 1);
        assert_eq!(parsed.spirv[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_parse_multiple_entries() {
        let bytes = module_bytes(
            &[("blur_x", 1, 3), ("blur_y", 0, 2)],
            &[SPIRV_MAGIC, 0x10200, 0, 8, 0],
        );
        let parsed = parse_module(&bytes).unwrap();
        assert_eq!(parsed.entry_points.len(), 2);
        assert_eq!(parsed.entry_points[0].name, "blur_x");
        assert_eq!(parsed.entry_points[0].binding_count(), 4);
        assert_eq!(parsed.entry_points[1].name, "blur_y");
    }

    #[test]
    fn test_rejects_missing_magic() {
        let bytes = module_bytes(&[("f", 0, 1)], &[0xdeadbeef]);
        assert!(parse_module(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_header() {
        let good = module_bytes(&[("f", 0, 1)], &[SPIRV_MAGIC]);
        let mut words: Vec<u32> = good
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        words[0] += 10;
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert!(parse_module(&bytes).is_err());
    }

    #[test]
    fn test_fingerprint_distinguishes_contents() {
        let a = module_bytes(&[("f", 0, 1)], &[SPIRV_MAGIC, 1]);
        let b = module_bytes(&[("f", 0, 2)], &[SPIRV_MAGIC, 1]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a), fingerprint(&a));
    }
}
