use chrono::{DateTime, Utc};
use rankwatch_core::{ProgramResult, Snapshot};
use rankwatch_notify::{ChangeNotification, NotificationField};

use crate::config::DirectionGlyphs;

pub const HEADLINE: &str = "**Место в конкурсе с учётом того, что люди подали оригинал аттестата и согласие на зачисление**";

/// Shown in place of the previous position for a program seen for the first time.
pub const NO_PREVIOUS_POSITION: &str = "—";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Improved,
    Worsened,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub current: ProgramResult,
    pub previous_position: Option<u32>,
}

impl ChangeEntry {
    pub fn direction(&self) -> Direction {
        match self.previous_position {
            None => Direction::New,
            Some(previous) if self.current.position > previous => Direction::Worsened,
            Some(_) => Direction::Improved,
        }
    }
}

/// Programs whose position moved, plus programs missing from `previous`.
/// Totals alone never produce an entry.
pub fn diff(current: &Snapshot, previous: &Snapshot) -> Vec<ChangeEntry> {
    current
        .iter()
        .filter_map(|program| {
            let previous_position = previous.get(&program.code).map(|p| p.position);
            if previous_position == Some(program.position) {
                return None;
            }
            Some(ChangeEntry {
                current: program.clone(),
                previous_position,
            })
        })
        .collect()
}

fn render_field(entry: &ChangeEntry, glyphs: Option<&DirectionGlyphs>) -> NotificationField {
    let glyph = match (entry.direction(), glyphs) {
        (Direction::Improved, Some(g)) => format!("{} ", g.improved),
        (Direction::Worsened, Some(g)) => format!("{} ", g.worsened),
        _ => String::new(),
    };
    let previous = entry
        .previous_position
        .map_or_else(|| NO_PREVIOUS_POSITION.to_string(), |p| p.to_string());
    let p = &entry.current;

    NotificationField {
        name: p.name.clone(),
        value: format!(
            "**Место в конкурсе:** {glyph}`{} ({previous})` **Всего:** `{}`\n\
             **Подано оригиналов:** `{}` **Всего:** `{}`\n\
             **Подано согласий:** `{}` **Всего:** `{}`",
            p.position,
            p.total_applications,
            p.originals,
            p.total_originals,
            p.consents,
            p.total_consents,
        ),
    }
}

pub fn render_notification(
    entries: &[ChangeEntry],
    glyphs: Option<&DirectionGlyphs>,
    timestamp: DateTime<Utc>,
) -> ChangeNotification {
    ChangeNotification {
        description: HEADLINE.to_string(),
        fields: entries.iter().map(|e| render_field(e, glyphs)).collect(),
        timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn program(code: &str, position: u32, totals: u32) -> ProgramResult {
        ProgramResult {
            code: code.to_string(),
            name: format!("Программа {code}"),
            position,
            consents: 2,
            originals: 3,
            total_applications: totals,
            total_originals: totals + 1,
            total_consents: totals + 2,
        }
    }

    fn glyphs() -> DirectionGlyphs {
        DirectionGlyphs {
            improved: ":arrow_up:".into(),
            worsened: ":arrow_down:".into(),
        }
    }

    #[test]
    fn equal_positions_produce_no_entries_even_when_totals_move() {
        let previous: Snapshot = [program("a", 4, 10)].into_iter().collect();
        let current: Snapshot = [program("a", 4, 25)].into_iter().collect();
        assert!(diff(&current, &previous).is_empty());
    }

    #[test]
    fn larger_position_is_worse_and_smaller_is_better() {
        let previous: Snapshot = [program("a", 4, 10), program("b", 9, 10)].into_iter().collect();
        let current: Snapshot = [program("a", 6, 10), program("b", 2, 10)].into_iter().collect();

        let entries = diff(&current, &previous);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].current.code, "a");
        assert_eq!(entries[0].direction(), Direction::Worsened);
        assert_eq!(entries[0].previous_position, Some(4));
        assert_eq!(entries[1].direction(), Direction::Improved);
    }

    #[test]
    fn program_missing_from_previous_is_new() {
        let previous = Snapshot::new();
        let current: Snapshot = [program("a", 1, 1)].into_iter().collect();
        let entries = diff(&current, &previous);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].direction(), Direction::New);
    }

    #[test]
    fn programs_only_in_previous_are_ignored() {
        let previous: Snapshot = [program("gone", 1, 1)].into_iter().collect();
        let current = Snapshot::new();
        assert!(diff(&current, &previous).is_empty());
    }

    #[test]
    fn field_renders_positions_and_running_totals() {
        let entry = ChangeEntry {
            current: program("a", 6, 10),
            previous_position: Some(4),
        };
        let field = render_field(&entry, Some(&glyphs()));
        assert_eq!(field.name, "Программа a");
        assert_eq!(
            field.value,
            "**Место в конкурсе:** :arrow_down: `6 (4)` **Всего:** `10`\n\
             **Подано оригиналов:** `3` **Всего:** `11`\n\
             **Подано согласий:** `2` **Всего:** `12`"
        );
    }

    #[test]
    fn field_without_glyphs_has_no_marker() {
        let entry = ChangeEntry {
            current: program("a", 2, 10),
            previous_position: Some(4),
        };
        let field = render_field(&entry, None);
        assert!(field.value.starts_with("**Место в конкурсе:** `2 (4)`"));
    }

    #[test]
    fn new_program_shows_dash_and_no_glyph() {
        let entry = ChangeEntry {
            current: program("a", 2, 10),
            previous_position: None,
        };
        let field = render_field(&entry, Some(&glyphs()));
        assert!(field.value.starts_with("**Место в конкурсе:** `2 (—)`"));
    }

    #[test]
    fn notification_carries_headline_and_one_field_per_entry() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 20, 9, 0, 0).single().unwrap();
        let entries = vec![
            ChangeEntry {
                current: program("a", 2, 10),
                previous_position: Some(4),
            },
            ChangeEntry {
                current: program("b", 5, 10),
                previous_position: Some(1),
            },
        ];
        let notification = render_notification(&entries, None, ts);
        assert_eq!(notification.description, HEADLINE);
        assert_eq!(notification.fields.len(), 2);
        assert_eq!(notification.timestamp, ts);
    }
}
