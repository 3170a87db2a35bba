//! Option catalog: the read-only list of configurator options.
//!
//! The catalog is read from a comma-separated file with a header row naming
//! at least the columns
//!
//! ```text
//! optionId,family,isStandardEquipment,isSelected,equipmentType
//! ```
//!
//! Boolean columns hold the literal strings `True` / `False`. Column order is
//! free and unknown columns are ignored. Fields may be double-quoted, with
//! `""` as an escaped quote.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{Error, Result};

/// Family name used for options without a family.
pub const NO_FAMILY: &str = "<none>";

/// One selectable configurator option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionInfo {
    pub id: String,
    /// Family name; empty means "no family".
    pub family: String,
    pub is_standard: bool,
    pub is_selected: bool,
    pub equipment_type: String,
}

impl OptionInfo {
    pub fn has_family(&self) -> bool {
        !self.family.is_empty()
    }

    /// Family name with [`NO_FAMILY`] substituted for the empty family.
    pub fn family_key(&self) -> &str {
        if self.family.is_empty() {
            NO_FAMILY
        } else {
            &self.family
        }
    }
}

/// Ordered option catalog with lookup by id.
///
/// Iteration order is file order; variable numbering relies on it.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    options: Vec<OptionInfo>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an option. A repeated id replaces the earlier record in place.
    pub fn push(&mut self, option: OptionInfo) {
        if let Some(&i) = self.index.get(&option.id) {
            log::warn!("Duplicate catalog entry for {}, keeping the last one", option.id);
            self.options[i] = option;
        } else {
            self.index.insert(option.id.clone(), self.options.len());
            self.options.push(option);
        }
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&OptionInfo> {
        self.index.get(id).map(|&i| &self.options[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionInfo> {
        self.options.iter()
    }

    /// Members of the family `family` (as returned by [`OptionInfo::family_key`]),
    /// in catalog order.
    pub fn family_members<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a OptionInfo> + 'a {
        self.options.iter().filter(move |o| o.family_key() == family)
    }

    /// Loads a catalog from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::parse(file).map_err(|e| match e {
            Error::Io { source, .. } => Error::io(path, source),
            other => other,
        })
    }

    /// Parses a catalog from comma-separated text.
    ///
    /// A quoted field may span several lines; errors report the line the
    /// record starts on.
    pub fn parse<R: Read>(reader: R) -> Result<Self> {
        let mut lines = read_records(reader)?.into_iter();

        let mut catalog = Catalog::new();
        let Some((line_num, header)) = lines.next() else {
            return Ok(catalog);
        };
        let cols = split_record(&header)
            .and_then(|fields| Columns::from_header(&fields))
            .map_err(|message| Error::Catalog {
                line: line_num,
                message,
            })?;

        for (line_num, line) in lines {
            let fields = split_record(&line).map_err(|message| Error::Catalog {
                line: line_num,
                message,
            })?;

            let id = field(&fields, Some(cols.id)).to_string();
            if id.is_empty() {
                return Err(Error::Catalog {
                    line: line_num,
                    message: "empty optionId".to_string(),
                });
            }
            let flag = |idx: Option<usize>, name: &str| -> Result<bool> {
                let raw = field(&fields, idx);
                parse_bool(raw).ok_or_else(|| Error::Catalog {
                    line: line_num,
                    message: format!("invalid boolean in column {}: {:?}", name, raw),
                })
            };

            catalog.push(OptionInfo {
                family: field(&fields, cols.family).to_string(),
                is_standard: flag(cols.is_standard, "isStandardEquipment")?,
                is_selected: flag(cols.is_selected, "isSelected")?,
                equipment_type: field(&fields, cols.equipment_type).to_string(),
                id,
            });
        }

        log::debug!("Parsed catalog with {} options", catalog.len());
        Ok(catalog)
    }
}

impl FromIterator<OptionInfo> for Catalog {
    fn from_iter<I: IntoIterator<Item = OptionInfo>>(iter: I) -> Self {
        let mut catalog = Catalog::new();
        for option in iter {
            catalog.push(option);
        }
        catalog
    }
}

struct Columns {
    id: usize,
    family: Option<usize>,
    is_standard: Option<usize>,
    is_selected: Option<usize>,
    equipment_type: Option<usize>,
}

impl Columns {
    fn from_header(header: &[String]) -> Result<Self, String> {
        let find = |name: &str| header.iter().position(|h| h.trim() == name);
        Ok(Self {
            id: find("optionId").ok_or("header has no optionId column")?,
            family: find("family"),
            is_standard: find("isStandardEquipment"),
            is_selected: find("isSelected"),
            equipment_type: find("equipmentType"),
        })
    }
}

fn field(fields: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| fields.get(i)).map(String::as_str).unwrap_or("")
}

/// Missing or empty boolean fields count as false.
fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "True" | "true" => Some(true),
        "False" | "false" | "" => Some(false),
        _ => None,
    }
}

/// Groups physical lines into records, joining lines while a quote is open.
fn read_records<R: Read>(reader: R) -> Result<Vec<(usize, String)>> {
    let mut records = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (i, line) in BufReader::new(reader).lines().enumerate() {
        let line = line.map_err(|e| Error::io("<catalog>", e))?;
        let line = line.trim_end_matches('\r');
        let (start, record) = match pending.take() {
            Some((start, mut record)) => {
                record.push('\n');
                record.push_str(line);
                (start, record)
            }
            None if line.trim().is_empty() => continue,
            None => (i + 1, line.to_string()),
        };
        // Escaped quotes come in pairs, so an odd count leaves a field open.
        if record.matches('"').count() % 2 == 1 {
            pending = Some((start, record));
        } else {
            records.push((start, record));
        }
    }
    records.extend(pending);
    Ok(records)
}

fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            '"' if current.is_empty() => quoted = true,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if quoted {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
