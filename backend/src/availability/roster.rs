use crate::availability::template::{WeeklyTemplate, Window};
use chrono::Weekday;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Staff,
    Coach,
}

/// A calendar-owning member of the organization.
#[derive(Clone, Debug, PartialEq)]
pub struct StaffMember {
    pub id: String,
    pub calendar_id: String,
    pub role: Role,
    /// Share of the template's daily windows this member offers, in (0, 1].
    /// Members with competing duties run on a reduced ("extended") schedule.
    pub availability_ratio: f64,
    /// Replaces the organization template for this member.
    pub template: Option<WeeklyTemplate>,
}

impl StaffMember {
    pub fn new(id: impl Into<String>, calendar_id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            calendar_id: calendar_id.into(),
            role,
            availability_ratio: 1.0,
            template: None,
        }
    }

    pub fn with_ratio(mut self, ratio: f64) -> Self {
        self.availability_ratio = ratio;
        self
    }

    pub fn with_template(mut self, template: WeeklyTemplate) -> Self {
        self.template = Some(template);
        self
    }

    /// Windows this member offers on `weekday`: the first
    /// `ceil(n * ratio)` windows of the effective template.
    pub fn windows_for(&self, base: &WeeklyTemplate, weekday: Weekday) -> Vec<Window> {
        let all = self.template.as_ref().unwrap_or(base).windows(weekday);
        let ratio = if self.availability_ratio.is_finite() {
            self.availability_ratio.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let keep = (all.len() as f64 * ratio).ceil() as usize;
        all.iter().take(keep).copied().collect()
    }
}

/// The fixed set of staff and coach calendars.
#[derive(Clone, Debug, Default)]
pub struct Roster {
    members: Vec<StaffMember>,
}

impl Roster {
    pub fn new(members: Vec<StaffMember>) -> Self {
        Self { members }
    }

    pub fn get(&self, id: &str) -> Option<&StaffMember> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn members(&self) -> &[StaffMember] {
        &self.members
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = &StaffMember> {
        self.members.iter().filter(move |m| m.role == role)
    }

    pub fn calendar_ids(&self, role: Role) -> Vec<String> {
        self.with_role(role).map(|m| m.calendar_id.clone()).collect()
    }

    pub fn all_calendar_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.calendar_id.clone()).collect()
    }

    pub fn by_calendar(&self, calendar_id: &str) -> Option<&StaffMember> {
        self.members.iter().find(|m| m.calendar_id == calendar_id)
    }
}
