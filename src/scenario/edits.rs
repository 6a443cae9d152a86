//! Enrollment edits on a scenario snapshot.

use crate::model::{EnrollmentDraft, ScenarioSnapshot};

impl ScenarioSnapshot {
    /// Rename a class and carry its students over. Returns false when no
    /// class has the old name; the students are moved either way.
    pub fn rename_class(&mut self, old: &str, new: &str) -> bool {
        let found = match self.classes.values_mut().find(|c| c.class_name == old) {
            Some(class) => {
                class.class_name = new.to_string();
                true
            }
            None => false,
        };
        if let Some(students) = self.enrollments.remove(old) {
            self.enrollments
                .entry(new.to_string())
                .or_default()
                .extend(students);
        }
        found
    }

    pub fn add_student(&mut self, class_name: &str, student_id: &str, payload: EnrollmentDraft) {
        self.enrollments
            .entry(class_name.to_string())
            .or_default()
            .insert(student_id.to_string(), payload);
    }

    pub fn remove_student(&mut self, class_name: &str, student_id: &str) -> bool {
        let Some(students) = self.enrollments.get_mut(class_name) else {
            return false;
        };
        let removed = students.remove(student_id).is_some();
        if students.is_empty() {
            self.enrollments.remove(class_name);
        }
        removed
    }

    /// Move a student's payload between classes; false when the student is
    /// not in `from`.
    pub fn move_student(&mut self, from: &str, to: &str, student_id: &str) -> bool {
        let Some(payload) = self
            .enrollments
            .get_mut(from)
            .and_then(|students| students.remove(student_id))
        else {
            return false;
        };
        if self.enrollments.get(from).is_some_and(|s| s.is_empty()) {
            self.enrollments.remove(from);
        }
        self.add_student(to, student_id, payload);
        true
    }
}
