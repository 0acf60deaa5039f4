//! The compiled-module container: a side-car header describing each entry
//! point's buffer bindings, followed by the SPIR-V binary.
//!
//! The header layout (little-endian u32 words):
//!
//! ```text
//! [0] header_word_count + 1          total header length incl. this word
//! [1] entry_point_count N
//! repeat N times:
//!   [0] uniform_buffer_count
//!   [1] storage_buffer_count
//!   [2] padded_name_length (bytes, multiple of 4)
//!   [3..] UTF-8 name, null-terminated, zero-padded
//! ```
//!
//! The runtime parses the header first and hands the body to the SPIR-V
//! loader verbatim.

use log::{debug, warn};

use crate::error::Result;
use crate::{bail_spirv, err_spirv};

/// Per-entry-point binding summary, as recorded by the emitter and
/// consumed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSet {
    pub entry_point_name: String,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
}

/// A compiled kernel module: side-car header words plus SPIR-V body words.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub header: Vec<u32>,
    pub body: Vec<u32>,
}

impl CompiledModule {
    pub fn new(descriptor_sets: &[DescriptorSet], body: Vec<u32>) -> CompiledModule {
        let module = CompiledModule {
            header: encode_header(descriptor_sets),
            body,
        };
        module.maybe_dump_body();
        module
    }

    /// The full little-endian byte stream: header then body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity((self.header.len() + self.body.len()) * 4);
        for w in self.header.iter().chain(&self.body) {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<CompiledModule> {
        if bytes.len() % 4 != 0 {
            bail_spirv!("module size {} is not a multiple of 4 bytes", bytes.len());
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let header_len = *words
            .first()
            .ok_or_else(|| err_spirv!("empty module"))? as usize;
        if header_len == 0 || header_len > words.len() {
            bail_spirv!("corrupt module header length {}", header_len);
        }
        Ok(CompiledModule {
            header: words[..header_len].to_vec(),
            body: words[header_len..].to_vec(),
        })
    }

    /// Decode the side-car header back into the descriptor-set table.
    pub fn parse_header(&self) -> Result<Vec<DescriptorSet>> {
        parse_header(&self.header)
    }

    fn maybe_dump_body(&self) {
        let Ok(path) = std::env::var("HL_SPIRV_DUMP_FILE") else {
            return;
        };
        if path.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(self.body.len() * 4);
        for w in &self.body {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        match std::fs::write(&path, &bytes) {
            Ok(()) => debug!("wrote SPIR-V body ({} bytes) to {}", bytes.len(), path),
            Err(e) => warn!("failed to dump SPIR-V body to {}: {}", path, e),
        }
    }
}

pub fn encode_header(descriptor_sets: &[DescriptorSet]) -> Vec<u32> {
    let mut header = Vec::new();
    header.push(descriptor_sets.len() as u32);
    for ds in descriptor_sets {
        let mut name_bytes = ds.entry_point_name.as_bytes().to_vec();
        name_bytes.push(0);
        while name_bytes.len() % 4 != 0 {
            name_bytes.push(0);
        }
        header.push(ds.uniform_buffer_count);
        header.push(ds.storage_buffer_count);
        header.push(name_bytes.len() as u32);
        for c in name_bytes.chunks_exact(4) {
            header.push(u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        }
    }
    // Total header length, including this word.
    header.insert(0, header.len() as u32 + 1);
    header
}

pub fn parse_header(header: &[u32]) -> Result<Vec<DescriptorSet>> {
    let mut pos = 0usize;
    let mut next = |what: &str| -> Result<u32> {
        let w = header
            .get(pos)
            .copied()
            .ok_or_else(|| err_spirv!("truncated module header reading {}", what))?;
        pos += 1;
        Ok(w)
    };
    let total = next("header length")? as usize;
    if total != header.len() {
        bail_spirv!(
            "module header length mismatch: declared {}, got {}",
            total,
            header.len()
        );
    }
    let count = next("entry point count")?;
    let mut sets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let uniform_buffer_count = next("uniform buffer count")?;
        let storage_buffer_count = next("storage buffer count")?;
        let padded_len = next("name length")? as usize;
        if padded_len % 4 != 0 {
            bail_spirv!("entry point name length {} is not word-aligned", padded_len);
        }
        let mut bytes = Vec::with_capacity(padded_len);
        for _ in 0..padded_len / 4 {
            bytes.extend_from_slice(&next("entry point name")?.to_le_bytes());
        }
        let name_end = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| err_spirv!("entry point name is not null-terminated"))?;
        let entry_point_name = std::str::from_utf8(&bytes[..name_end])
            .map_err(|_| err_spirv!("entry point name is not UTF-8"))?
            .to_string();
        sets.push(DescriptorSet {
            entry_point_name,
            uniform_buffer_count,
            storage_buffer_count,
        });
    }
    Ok(sets)
}
