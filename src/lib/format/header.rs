//! Alignment header: raw text plus the lookups the engine needs.

use ahash::AHashMap;
use noodles::sam::Header;
use noodles::sam::header::record::value::map::read_group::tag as rg_tag;

/// Name reported for reads without a library.
pub const UNKNOWN_LIBRARY: &str = "Unknown Library";

/// Parsed header shared by every stage of one pipeline.
///
/// The text is kept verbatim so that it can be re-emitted unchanged apart from the sort order.
#[derive(Debug, Clone, Default)]
pub struct AlignmentHeader {
    text: String,
    references: Vec<(String, usize)>,
    reference_index: AHashMap<String, i32>,
    libraries: Vec<String>,
    rg_to_library: AHashMap<Vec<u8>, u16>,
}

impl AlignmentHeader {
    /// Parse SAM header text; references come from its `@SQ` lines.
    pub fn from_text(text: &str) -> Result<Self, String> {
        let header: Header = text.parse().map_err(|e| format!("malformed header text: {e}"))?;
        let references = header
            .reference_sequences()
            .iter()
            .map(|(name, map)| (name.to_string(), map.length().get()))
            .collect();
        Ok(Self::build(text.to_string(), references, &header))
    }

    /// Combine header text with an explicit reference dictionary (the binary BAM header carries
    /// its own copy, which takes precedence).
    pub fn with_references(text: &str, references: Vec<(String, usize)>) -> Result<Self, String> {
        let header: Header = text.parse().map_err(|e| format!("malformed header text: {e}"))?;
        Ok(Self::build(text.to_string(), references, &header))
    }

    fn build(text: String, references: Vec<(String, usize)>, header: &Header) -> Self {
        let reference_index = references
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i as i32))
            .collect();

        // Libraries are ordered by name; ordinal 0 is the unknown library.
        let mut names: Vec<String> = header
            .read_groups()
            .iter()
            .filter_map(|(_, rg)| rg.other_fields().get(&rg_tag::LIBRARY).map(|lb| lb.to_string()))
            .collect();
        names.sort();
        names.dedup();
        let mut libraries = vec![UNKNOWN_LIBRARY.to_string()];
        libraries.extend(names);

        let rg_to_library = header
            .read_groups()
            .iter()
            .map(|(id, rg)| {
                let ordinal = rg
                    .other_fields()
                    .get(&rg_tag::LIBRARY)
                    .and_then(|lb| libraries.iter().skip(1).position(|l| *l == lb.to_string()))
                    .map_or(0, |i| i + 1);
                (id.to_vec(), ordinal as u16)
            })
            .collect();

        Self { text, references, reference_index, libraries, rg_to_library }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn references(&self) -> &[(String, usize)] {
        &self.references
    }

    /// Index of the reference named `name`.
    #[must_use]
    pub fn reference_index(&self, name: &[u8]) -> Option<i32> {
        std::str::from_utf8(name).ok().and_then(|n| self.reference_index.get(n)).copied()
    }

    /// Library ordinal for a read group id; 0 when unknown.
    #[must_use]
    pub fn library_ordinal(&self, read_group: Option<&[u8]>) -> u16 {
        read_group.and_then(|rg| self.rg_to_library.get(rg)).copied().unwrap_or(0)
    }

    /// Library name for an ordinal returned by [`Self::library_ordinal`].
    #[must_use]
    pub fn library_name(&self, ordinal: u16) -> &str {
        self.libraries.get(ordinal as usize).map_or(UNKNOWN_LIBRARY, String::as_str)
    }

    /// Copy of this header whose `@HD` line carries `SO:{sort_order}`.
    #[must_use]
    pub fn with_sort_order(&self, sort_order: &str) -> Self {
        let mut text = String::with_capacity(self.text.len() + 16);
        let mut has_hd = false;
        for line in self.text.lines() {
            if line.starts_with("@HD") {
                has_hd = true;
                let mut fields: Vec<String> = line
                    .split('\t')
                    .filter(|f| !f.starts_with("SO:") && !f.starts_with("GO:"))
                    .map(str::to_string)
                    .collect();
                fields.push(format!("SO:{sort_order}"));
                text.push_str(&fields.join("\t"));
            } else {
                text.push_str(line);
            }
            text.push('\n');
        }
        if !has_hd {
            text.insert_str(0, &format!("@HD\tVN:1.6\tSO:{sort_order}\n"));
        }
        Self { text, ..self.clone() }
    }

    /// Binary BAM header: magic, text and reference dictionary.
    #[must_use]
    pub fn to_bam_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.text.len() + self.references.len() * 32);
        out.extend_from_slice(b"BAM\x01");
        out.extend_from_slice(&(self.text.len() as i32).to_le_bytes());
        out.extend_from_slice(self.text.as_bytes());
        out.extend_from_slice(&(self.references.len() as i32).to_le_bytes());
        for (name, len) in &self.references {
            out.extend_from_slice(&(name.len() as i32 + 1).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.extend_from_slice(&(*len as i32).to_le_bytes());
        }
        out
    }

    /// SAM header text with a trailing newline when non-empty.
    #[must_use]
    pub fn to_sam_bytes(&self) -> Vec<u8> {
        let mut out = self.text.clone().into_bytes();
        if !out.is_empty() && out.last() != Some(&b'\n') {
            out.push(b'\n');
        }
        out
    }
}
