// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parser for the `npu-smi info` summary table.
//!
//! The table is a sequence of two-line chip records followed by an optional
//! process table:
//!
//! ```text
//! | NPU   Name     | Health  | Power(W)  Temp(C)  Hugepages-Usage(page) |
//! | Chip  Phy-ID   | Bus-Id  | AICore(%) Memory-Usage(MB) HBM-Usage(MB) |
//! +================+=========+==========================================+
//! | 0     910B2C   | OK      | 88.6      51       0    / 0             |
//! | 0     0        | 0000:.. | 0         0 / 0    20701/ 65536         |
//! ```
//!
//! Values in the last cell are located through their header label, since
//! widths and the set of labels drift between driver releases. Each label owns
//! the character span from its own start to the start of the next label, and a
//! value row is sliced by those spans before it is tokenized, so a blank cell
//! reads as not applicable instead of pulling later values left. The shape of a
//! table (HBM column or not, what follows the chip id) is probed once from the
//! headers, falling back to the first record and positional values.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::device::common::parsers::{
    parse_mb_to_bytes, parse_power_w_to_mw, parse_reading, parse_temperature, parse_text,
    parse_used_total_mb, parse_utilization,
};
use crate::device::reading::Reading;
use crate::device::types::{MemoryInfo, RawProcess};
use crate::error::{Error, Result};

static BANNER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"npu-smi\s+\S+\s+Version:\s*(?P<version>\S+)").unwrap());

static NO_PROCESS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)No running processes found in NPU\s+(?P<npu>\d+)").unwrap());

static SLASH_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*/\s*").unwrap());

const POWER_LABEL: &str = "Power";
const TEMP_LABEL: &str = "Temp";
const AICORE_LABEL: &str = "AICore";
const MEMORY_LABEL: &str = "Memory-Usage";
const HBM_LABEL: &str = "HBM-Usage";

/// Where device memory is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryColumns {
    /// Separate HBM column; the plain memory column is host-side DDR.
    Hbm,
    /// Only the device memory column.
    DeviceMemory,
}

/// What follows the chip id in the first cell of a record's second line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipColumn {
    ChipOnly,
    Device,
    PhyId,
}

/// A header label and the byte range of the row its values are printed in.
///
/// `span` is `None` when the label was assumed rather than read from a header
/// row; values are then taken by position.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    label: String,
    span: Option<Range<usize>>,
}

impl Column {
    fn assumed(label: &str) -> Self {
        Self {
            label: label.to_string(),
            span: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub memory: MemoryColumns,
    pub chip: ChipColumn,
    status_columns: Vec<Column>,
    usage_columns: Vec<Column>,
}

impl TableShape {
    fn from_headers(status: Option<&[Column]>, chip_cell: &str, usage: &[Column]) -> Self {
        let memory = if usage.iter().any(|c| c.label.starts_with(HBM_LABEL)) {
            MemoryColumns::Hbm
        } else {
            MemoryColumns::DeviceMemory
        };
        let chip = match chip_cell.split_whitespace().nth(1) {
            None => ChipColumn::ChipOnly,
            Some(label) if label.eq_ignore_ascii_case("Phy-ID") => ChipColumn::PhyId,
            Some(_) => ChipColumn::Device,
        };
        Self {
            memory,
            chip,
            status_columns: status
                .map(<[Column]>::to_vec)
                .unwrap_or_else(Self::default_status_columns),
            usage_columns: usage.to_vec(),
        }
    }

    /// Guess the shape from a record when the header rows are missing.
    fn from_first_record(chip_cell: &str, usage_values: &[String]) -> Self {
        let pairs = usage_values.iter().filter(|v| v.contains('/')).count();
        let memory = if pairs >= 2 {
            MemoryColumns::Hbm
        } else {
            MemoryColumns::DeviceMemory
        };
        let chip = if chip_cell.split_whitespace().count() > 1 {
            ChipColumn::Device
        } else {
            ChipColumn::ChipOnly
        };
        let mut usage_columns = vec![Column::assumed(AICORE_LABEL), Column::assumed(MEMORY_LABEL)];
        if memory == MemoryColumns::Hbm {
            usage_columns.push(Column::assumed(HBM_LABEL));
        }
        Self {
            memory,
            chip,
            status_columns: Self::default_status_columns(),
            usage_columns,
        }
    }

    fn default_status_columns() -> Vec<Column> {
        vec![
            Column::assumed(POWER_LABEL),
            Column::assumed(TEMP_LABEL),
            Column::assumed("Hugepages-Usage"),
        ]
    }
}

/// One chip as listed in the device section.
#[derive(Debug, Clone, PartialEq)]
pub struct ChipRecord {
    pub npu_id: u32,
    pub chip_id: u32,
    /// Device or physical id printed next to the chip id, if any.
    pub device_id: Option<u32>,
    pub name: Reading<String>,
    pub health: Reading<String>,
    pub bus_id: Reading<String>,
    /// Milliwatts.
    pub power: Reading<u32>,
    pub temperature: Reading<u32>,
    pub aicore: Reading<f64>,
    pub memory: MemoryInfo,
}

impl ChipRecord {
    pub fn key(&self) -> (u32, u32) {
        (self.npu_id, self.chip_id)
    }

    pub fn memory_percent(&self) -> Reading<f64> {
        self.memory.percent()
    }
}

/// A fully parsed `npu-smi info` table.
#[derive(Debug, Clone, Default)]
pub struct NpuSmiTable {
    pub version: Option<String>,
    pub shape: Option<TableShape>,
    /// Sorted by (npu, chip); the position is the logical index.
    pub chips: Vec<ChipRecord>,
    pub has_process_section: bool,
    processes: HashMap<(u32, u32), Vec<RawProcess>>,
    idle_npus: HashSet<u32>,
}

impl NpuSmiTable {
    pub fn parse(text: &str) -> Result<Self> {
        Parser::default().run(text)
    }

    pub fn keys(&self) -> Vec<(u32, u32)> {
        self.chips.iter().map(ChipRecord::key).collect()
    }

    pub fn chip(&self, logical_index: usize) -> Option<&ChipRecord> {
        self.chips.get(logical_index)
    }

    /// Processes listed for a chip in this table.
    ///
    /// `Some(vec![])` when the tool said the NPU has no running processes,
    /// `None` when nothing was listed for the chip at all.
    pub fn processes_for(&self, npu_id: u32, chip_id: u32) -> Option<Vec<RawProcess>> {
        if let Some(listed) = self.processes.get(&(npu_id, chip_id)) {
            return Some(listed.clone());
        }
        self.idle_npus.contains(&npu_id).then(Vec::new)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Devices,
    Processes,
}

struct PendingRecord {
    npu_id: u32,
    name: Reading<String>,
    health: Reading<String>,
    status_line: String,
}

struct Parser {
    table: NpuSmiTable,
    section: Section,
    status_columns: Option<Vec<Column>>,
    pending: Option<PendingRecord>,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            table: NpuSmiTable::default(),
            section: Section::Devices,
            status_columns: None,
            pending: None,
        }
    }
}

fn split_cells(line: &str) -> Option<Vec<&str>> {
    let inner = line.trim().strip_prefix('|')?;
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    Some(inner.split('|').map(str::trim).collect())
}

/// Split a value cell into tokens, keeping "used / total" pairs together.
fn value_tokens(cell: &str) -> Vec<String> {
    SLASH_PATTERN
        .replace_all(cell, "/")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Words of `text` with their byte offsets.
fn words_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                words.push((s, &text[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        words.push((s, &text[s..]));
    }
    words
}

/// Labels of the third cell of a header row, each spanning up to the next.
fn header_columns(line: &str) -> Vec<Column> {
    let pipes: Vec<usize> = line.match_indices('|').map(|(i, _)| i).collect();
    let Some(open) = pipes.get(2).map(|p| p + 1) else {
        return Vec::new();
    };
    let close = pipes.get(3).copied().unwrap_or(line.len());
    let words = words_with_offsets(&line[open..close]);
    words
        .iter()
        .enumerate()
        .map(|(k, &(offset, label))| {
            let start = if k == 0 { open } else { open + offset };
            let end = words.get(k + 1).map_or(close, |&(next, _)| open + next);
            Column {
                label: label.to_string(),
                span: Some(start..end),
            }
        })
        .collect()
}

fn slice_span<'a>(line: &'a str, span: &Range<usize>) -> &'a str {
    let end = span.end.min(line.len());
    let start = span.start.min(end);
    let text = line.get(start..end).unwrap_or_default();
    text.split('|').next().unwrap_or_default().trim()
}

/// The value printed under `label` on a record line.
fn labelled(columns: &[Column], line: &str, label: &str) -> Option<String> {
    let label = label.to_ascii_lowercase();
    let position = columns
        .iter()
        .position(|c| c.label.to_ascii_lowercase().starts_with(&label))?;
    match &columns[position].span {
        Some(span) => Some(SLASH_PATTERN.replace_all(slice_span(line, span), "/").into_owned()),
        None => {
            let cells = split_cells(line)?;
            value_tokens(cells.get(2)?).into_iter().nth(position)
        }
    }
}

impl Parser {
    fn run(mut self, text: &str) -> Result<NpuSmiTable> {
        if text.trim().is_empty() {
            return Err(Error::Parse("npu-smi produced no output".to_string()));
        }

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('+') {
                if self.pending.take().is_some() {
                    debug!("npu-smi record without a second line was dropped");
                }
                continue;
            }
            let Some(cells) = split_cells(trimmed) else {
                continue;
            };
            self.row(trimmed, &cells);
        }

        let mut table = self.table;
        if table.chips.is_empty() {
            return Err(Error::Parse("no device records in npu-smi output".to_string()));
        }
        table.chips.sort_by_key(ChipRecord::key);
        table.chips.dedup_by_key(|chip| chip.key());
        Ok(table)
    }

    fn row(&mut self, line: &str, cells: &[&str]) {
        let first = cells.first().copied().unwrap_or_default();

        if let Some(caps) = BANNER_PATTERN.captures(first) {
            self.table.version = Some(caps["version"].to_string());
            return;
        }
        if cells.iter().any(|c| c.contains("Process id")) {
            self.section = Section::Processes;
            self.table.has_process_section = true;
            return;
        }

        match self.section {
            Section::Devices => self.device_row(line, cells),
            Section::Processes => self.process_row(cells),
        }
    }

    fn device_row(&mut self, line: &str, cells: &[&str]) {
        if cells.len() < 3 {
            return;
        }
        let (first, second, third) = (cells[0], cells[1], cells[2]);

        if first.starts_with("NPU") && second.contains("Health") {
            self.status_columns = Some(header_columns(line));
            return;
        }
        if first.starts_with("Chip") && second.contains("Bus-Id") {
            self.table.shape = Some(TableShape::from_headers(
                self.status_columns.as_deref(),
                first,
                &header_columns(line),
            ));
            return;
        }

        match self.pending.take() {
            None => self.pending = Self::first_line(line, first, second),
            Some(pending) => self.second_line(pending, line, [first, second, third]),
        }
    }

    fn first_line(line: &str, first: &str, second: &str) -> Option<PendingRecord> {
        let mut tokens = first.split_whitespace();
        let npu_id = tokens.next()?.parse::<u32>().ok()?;
        let name = tokens.collect::<Vec<_>>().join(" ");
        Some(PendingRecord {
            npu_id,
            name: parse_text(&name),
            health: parse_text(second),
            status_line: line.to_string(),
        })
    }

    fn second_line(&mut self, pending: PendingRecord, line: &str, cells: [&str; 3]) {
        let [first, second, third] = cells;
        let mut ids = first.split_whitespace();
        let Some(chip_id) = ids.next().and_then(|t| t.parse::<u32>().ok()) else {
            debug!(row = first, "unrecognised npu-smi chip row");
            return;
        };
        let device_id = ids.next().and_then(|t| t.parse::<u32>().ok());

        let shape = self
            .table
            .shape
            .get_or_insert_with(|| TableShape::from_first_record(first, &value_tokens(third)))
            .clone();

        let status = |label: &str| labelled(&shape.status_columns, &pending.status_line, label);
        let usage = |label: &str| labelled(&shape.usage_columns, line, label);

        let memory_label = match shape.memory {
            MemoryColumns::Hbm => HBM_LABEL,
            MemoryColumns::DeviceMemory => MEMORY_LABEL,
        };
        let (used, total) = usage(memory_label)
            .map(|pair| parse_used_total_mb(&pair))
            .unwrap_or((Reading::NotApplicable, Reading::NotApplicable));

        self.table.chips.push(ChipRecord {
            npu_id: pending.npu_id,
            chip_id,
            device_id,
            name: pending.name,
            health: pending.health,
            bus_id: parse_text(second),
            power: status(POWER_LABEL)
                .map_or(Reading::NotApplicable, |v| parse_power_w_to_mw(&v)),
            temperature: status(TEMP_LABEL)
                .map_or(Reading::NotApplicable, |v| parse_temperature(&v)),
            aicore: usage(AICORE_LABEL)
                .map_or(Reading::NotApplicable, |v| parse_utilization(&v)),
            memory: MemoryInfo::new(total, Reading::NotApplicable, used),
        });
    }

    fn process_row(&mut self, cells: &[&str]) {
        if let Some(caps) = cells.first().and_then(|c| NO_PROCESS_PATTERN.captures(c)) {
            if let Ok(npu_id) = caps["npu"].parse::<u32>() {
                self.table.idle_npus.insert(npu_id);
            }
            return;
        }
        if cells.len() < 4 {
            return;
        }
        let mut ids = cells[0].split_whitespace();
        let (Some(npu_id), Some(chip_id)) = (
            ids.next().and_then(|t| t.parse::<u32>().ok()),
            ids.next().and_then(|t| t.parse::<u32>().ok()),
        ) else {
            return;
        };
        let Reading::Value(pid) = parse_reading::<u32>(cells[1]) else {
            return;
        };
        let name = parse_text(cells[2]).value();
        self.table
            .processes
            .entry((npu_id, chip_id))
            .or_default()
            .push(RawProcess {
                pid,
                used_memory: parse_mb_to_bytes(cells[3]),
                name,
            });
    }
}
