use std::fmt;

const SEPARATOR: char = '-';

/// A cell of the timetable grid: one teacher column, one period row, one day.
///
/// The wire form is `teacherId-periodId-day`. Segments therefore must not
/// contain `-` themselves; anything that does not split into exactly three
/// non-empty segments is not an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotAddress {
    pub teacher_id: String,
    pub period_id: String,
    pub day: String,
}

impl SlotAddress {
    pub fn new(
        teacher_id: impl Into<String>,
        period_id: impl Into<String>,
        day: impl Into<String>,
    ) -> Self {
        Self {
            teacher_id: teacher_id.into(),
            period_id: period_id.into(),
            day: day.into(),
        }
    }

    pub fn parse(address: &str) -> Option<Self> {
        let parts: Vec<&str> = address.split(SEPARATOR).collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self::new(parts[0], parts[1], parts[2]))
    }

    /// Key used by the per-slot maps of a class (`day-periodId`).
    pub fn slot_key(&self) -> String {
        slot_key(&self.day, &self.period_id)
    }

    /// Group id shared by the classes merged into this cell.
    pub fn group_id(&self) -> String {
        format!("group_{}", self)
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format(&self.teacher_id, &self.period_id, &self.day))
    }
}

pub fn format(teacher_id: &str, period_id: &str, day: &str) -> String {
    format!("{teacher_id}{SEPARATOR}{period_id}{SEPARATOR}{day}")
}

pub fn slot_key(day: &str, period_id: &str) -> String {
    format!("{day}{SEPARATOR}{period_id}")
}
