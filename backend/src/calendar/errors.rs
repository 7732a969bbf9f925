use thiserror::Error;

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("calendar unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: usize, reason: String },

    #[error("event not found: {0}")]
    NotFound(String),

    #[error("calendar rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid response from calendar: {0}")]
    InvalidResponse(String),

    #[error("calendar {calendar_id} needs more than {pages} pages for one listing")]
    PageLimit { calendar_id: String, pages: usize },
}

impl CalendarError {
    /// True for upstream failures the caller may retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            CalendarError::Unavailable { .. } => true,
            CalendarError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CalendarError::NotFound(_))
    }
}
