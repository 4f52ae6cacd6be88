//! Ranking page extraction + per-program rank computation.

use rankwatch_core::{ProgramResult, RawProgramSection, RawRow, Snapshot, FLAG_SET};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::warn;

const RANK_COLUMN: usize = 0;
const ORIGINAL_COLUMN: usize = 2;
const CONSENT_COLUMN: usize = 3;
const MIN_RANKED_CELLS: usize = 4;

/// Index of the program name span inside the section heading.
const NAME_SPAN_INDEX: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("tracked cell has no enclosing <{tag}>")]
    MissingAncestor { tag: &'static str },
    #[error("program section has no <a name> anchor")]
    MissingProgramCode,
    #[error("program {code} has no name span in its <h2>")]
    MissingProgramName { code: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RankError {
    #[error("program {code}: ranked row {row_index} has {cells} cells, expected at least 4")]
    ShortRow {
        code: String,
        row_index: usize,
        cells: usize,
    },
    #[error("program {code}: no row carries rank marker {marker:?}")]
    TrackedRowNotFound { code: String, marker: String },
}

fn selector(css: &str) -> Result<Selector, ExtractError> {
    Selector::parse(css).map_err(|e| ExtractError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn cell_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn nearest_ancestor<'a>(element: ElementRef<'a>, tags: &[&str]) -> Option<ElementRef<'a>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| tags.contains(&el.value().name()))
}

fn direct_cells(row: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|el| el.value().name() == "td")
}

fn table_rows(table: ElementRef<'_>, row_sel: &Selector) -> Vec<RawRow> {
    table
        .select(row_sel)
        .filter(|row| nearest_ancestor(*row, &["table"]).map(|t| t.id()) == Some(table.id()))
        .map(|row| direct_cells(row).map(cell_text).collect::<RawRow>())
        .filter(|cells| !cells.is_empty())
        .collect()
}

struct SectionSelectors {
    row: Selector,
    heading: Selector,
    span: Selector,
    anchor: Selector,
}

impl SectionSelectors {
    fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            row: selector("tr")?,
            heading: selector("h2")?,
            span: selector("span")?,
            anchor: selector("a[name]")?,
        })
    }
}

fn section_for_cell(
    cell: ElementRef<'_>,
    sel: &SectionSelectors,
) -> Result<RawProgramSection, ExtractError> {
    let row = nearest_ancestor(cell, &["tr"]).ok_or(ExtractError::MissingAncestor { tag: "tr" })?;
    let rank_marker = direct_cells(row).next().map(cell_text).unwrap_or_default();
    let table =
        nearest_ancestor(row, &["table"]).ok_or(ExtractError::MissingAncestor { tag: "table" })?;
    let article = nearest_ancestor(table, &["article", "section"])
        .ok_or(ExtractError::MissingAncestor { tag: "article" })?;

    let code = article
        .select(&sel.anchor)
        .next()
        .and_then(|a| a.value().attr("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or(ExtractError::MissingProgramCode)?;

    let name = article
        .select(&sel.heading)
        .next()
        .and_then(|h| h.select(&sel.span).nth(NAME_SPAN_INDEX))
        .map(cell_text)
        .ok_or_else(|| ExtractError::MissingProgramName { code: code.clone() })?;

    Ok(RawProgramSection {
        code,
        name,
        rank_marker,
        rows: table_rows(table, &sel.row),
    })
}

/// Find every table cell whose text is exactly `tracked_id` and lift out the
/// program section around it.
///
/// An empty result means the identifier does not appear on the page.
pub fn extract(html: &str, tracked_id: &str) -> Result<Vec<RawProgramSection>, ExtractError> {
    let document = Html::parse_document(html);
    let cell_sel = selector("td")?;
    let section_sel = SectionSelectors::new()?;

    document
        .select(&cell_sel)
        .filter(|cell| cell_text(*cell) == tracked_id)
        .map(|cell| section_for_cell(cell, &section_sel))
        .collect()
}

fn is_rank_marker(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

/// Rank the tracked applicant among qualified applicants of one program.
///
/// Only rows whose first cell is a number take part; the position counts the
/// rows ahead that have both the original and the consent flag set.
pub fn rank(section: &RawProgramSection) -> Result<ProgramResult, RankError> {
    let mut total_applications = 0u32;
    let mut total_originals = 0u32;
    let mut total_consents = 0u32;
    let mut captured: Option<(u32, u32, u32)> = None;

    for (row_index, row) in section.rows.iter().enumerate() {
        let Some(marker) = row.get(RANK_COLUMN) else {
            continue;
        };
        if !is_rank_marker(marker) {
            continue;
        }
        if row.len() < MIN_RANKED_CELLS {
            return Err(RankError::ShortRow {
                code: section.code.clone(),
                row_index,
                cells: row.len(),
            });
        }

        if *marker == section.rank_marker {
            captured = Some((total_applications, total_originals, total_consents));
        }

        let original = row[ORIGINAL_COLUMN] == FLAG_SET;
        let consent = row[CONSENT_COLUMN] == FLAG_SET;
        if original {
            total_originals += 1;
        }
        if consent {
            total_consents += 1;
        }
        if original && consent {
            total_applications += 1;
        }
    }

    let (ahead, originals, consents) = captured.ok_or_else(|| RankError::TrackedRowNotFound {
        code: section.code.clone(),
        marker: section.rank_marker.clone(),
    })?;

    Ok(ProgramResult {
        code: section.code.clone(),
        name: section.name.clone(),
        position: ahead + 1,
        consents,
        originals,
        total_applications,
        total_originals,
        total_consents,
    })
}

/// Rank every section into one snapshot. A repeated code keeps the later section.
pub fn rank_all(sections: &[RawProgramSection]) -> Result<Snapshot, RankError> {
    let mut snapshot = Snapshot::new();
    for section in sections {
        let result = rank(section)?;
        if let Some(previous) = snapshot.insert(result) {
            warn!(
                code = %previous.code,
                "tracked identifier found twice in one program; keeping the later row"
            );
        }
    }
    Ok(snapshot)
}
