//! Encoding of booking state into human-editable calendar fields.
//!
//! Ownership lives in the event description as `[Booked by: <owner_id>]`;
//! status lives in the event color, with `ghost` additionally marked by a
//! title suffix. Everything outside this module works with `BookingStatus`
//! and `OwnerTag` only.

use crate::booking::model::BookingStatus;
use crate::calendar::EventColor;

pub const TAG_OPEN: &str = "[Booked by:";
pub const TAG_CLOSE: char = ']';
pub const GHOST_SUFFIX: &str = " ( Ghost )";

/// An owner tag as found in (or destined for) an event description. `raw`
/// is the exact substring, so copying a tag never alters its bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerTag {
    owner_id: String,
    raw: String,
}

impl OwnerTag {
    /// Canonical tag for `owner_id`. Returns `None` for ids that cannot be
    /// embedded (empty, or containing `]` or a line break).
    pub fn for_owner(owner_id: &str) -> Option<Self> {
        let owner_id = owner_id.trim();
        if !is_embeddable(owner_id) {
            return None;
        }
        Some(Self {
            owner_id: owner_id.to_string(),
            raw: format!("{TAG_OPEN} {owner_id}{TAG_CLOSE}"),
        })
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

pub fn is_embeddable(owner_id: &str) -> bool {
    !owner_id.trim().is_empty()
        && !owner_id.contains(TAG_CLOSE)
        && !owner_id.contains(['\n', '\r'])
}

/// Finds the first well-formed owner tag in `description`.
pub fn extract_tag(description: &str) -> Option<OwnerTag> {
    let mut from = 0;
    while let Some(pos) = description[from..].find(TAG_OPEN) {
        let open = from + pos;
        let body_start = open + TAG_OPEN.len();
        let close = body_start + description[body_start..].find(TAG_CLOSE)?;

        let owner_id = description[body_start..close].trim();
        if !owner_id.is_empty() && !owner_id.contains(['\n', '\r']) {
            return Some(OwnerTag {
                owner_id: owner_id.to_string(),
                raw: description[open..=close].to_string(),
            });
        }
        from = body_start;
    }
    None
}

pub fn extract_owner(description: &str) -> Option<String> {
    extract_tag(description).map(|t| t.owner_id)
}

/// Appends `tag` to `description` unless a tag is already present, in which
/// case the description is returned untouched.
pub fn embed_tag(description: &str, tag: &OwnerTag) -> String {
    if extract_tag(description).is_some() {
        return description.to_string();
    }
    if description.trim().is_empty() {
        return tag.raw.clone();
    }
    format!("{}\n\n{}", description.trim_end(), tag.raw)
}

/// `embed_tag` with the canonical tag for `owner_id`. Ids that cannot be
/// embedded leave the description unchanged.
pub fn embed_owner(description: &str, owner_id: &str) -> String {
    match OwnerTag::for_owner(owner_id) {
        Some(tag) => embed_tag(description, &tag),
        None => description.to_string(),
    }
}

pub fn color_from_status(status: BookingStatus) -> Option<EventColor> {
    match status {
        BookingStatus::Pending => None,
        BookingStatus::Attended => Some(EventColor::Basil),
        BookingStatus::Recall => Some(EventColor::Grape),
        BookingStatus::Special => Some(EventColor::Banana),
        BookingStatus::Rescheduled => Some(EventColor::Tangerine),
        BookingStatus::NoShow | BookingStatus::Ghost => Some(EventColor::Tomato),
        BookingStatus::Cancelled => Some(EventColor::Graphite),
    }
}

/// Reads the status a human (or this system) left on an event. Colors with
/// no meaning in the table read as `pending`; the lighter shades of green
/// and red are accepted as their strong counterparts.
pub fn status_from_color(color: Option<EventColor>, title: &str) -> BookingStatus {
    match color {
        Some(EventColor::Basil | EventColor::Sage) => BookingStatus::Attended,
        Some(EventColor::Grape) => BookingStatus::Recall,
        Some(EventColor::Banana) => BookingStatus::Special,
        Some(EventColor::Tangerine) => BookingStatus::Rescheduled,
        Some(EventColor::Tomato | EventColor::Flamingo) => {
            if has_ghost_suffix(title) {
                BookingStatus::Ghost
            } else {
                BookingStatus::NoShow
            }
        }
        Some(EventColor::Graphite) => BookingStatus::Cancelled,
        Some(EventColor::Lavender | EventColor::Peacock | EventColor::Blueberry) | None => {
            BookingStatus::Pending
        }
    }
}

pub fn has_ghost_suffix(title: &str) -> bool {
    title.trim_end().ends_with(GHOST_SUFFIX.trim_start())
}

fn strip_ghost_suffix(title: &str) -> &str {
    let marker = GHOST_SUFFIX.trim_start();
    let mut t = title.trim_end();
    while let Some(rest) = t.strip_suffix(marker) {
        t = rest.trim_end();
    }
    t
}

/// Title an event should carry in `status`: exactly one ghost suffix for
/// `ghost`, none otherwise. Titles already in the right shape are returned
/// byte-identical.
pub fn title_for_status(title: &str, status: BookingStatus) -> String {
    let ghost = status == BookingStatus::Ghost;
    if !ghost && !has_ghost_suffix(title) {
        return title.to_string();
    }

    let base = strip_ghost_suffix(title);
    if ghost {
        format!("{base}{GHOST_SUFFIX}")
    } else {
        base.to_string()
    }
}
