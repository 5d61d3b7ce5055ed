//! Selection of the UID range searched on each poll.
//!
//! Only the most recent handful of messages is inspected, which keeps every
//! search cheap no matter how large the mailbox grows.

use std::fmt;

/// A bounded UID range combined with a sender filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchWindow {
    /// Lowest UID searched (inclusive).
    pub lower: u32,
    /// Highest UID searched (inclusive).
    pub upper: u32,
    /// Only messages from this address match.
    pub sender: String,
}

impl SearchWindow {
    /// Computes the window for one poll.
    ///
    /// `next_uid` is the mailbox's next assignable UID (`None` or `Some(0)` when the
    /// server did not report one), `watermark` the highest UID seen so far and
    /// `span` how many UIDs below the upper bound are included.
    ///
    /// # Example
    ///
    /// ```
    /// use otp_keygate::SearchWindow;
    ///
    /// let window = SearchWindow::select(Some(100), 0, 12, "codes@example.com");
    /// assert_eq!((window.lower, window.upper), (87, 99));
    /// ```
    #[must_use]
    pub fn select(next_uid: Option<u32>, watermark: u32, span: u32, sender: &str) -> Self {
        let upper = match next_uid {
            Some(next) if next > 0 => next - 1,
            _ => watermark,
        };
        let lower = upper.saturating_sub(span).max(1);

        Self {
            lower,
            upper,
            sender: sender.to_string(),
        }
    }

    /// A window holding exactly one UID.
    #[must_use]
    pub fn single(uid: u32, sender: &str) -> Self {
        Self {
            lower: uid,
            upper: uid,
            sender: sender.to_string(),
        }
    }

    /// Returns `true` when no UID can fall inside the window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upper == 0 || self.upper < self.lower
    }

    /// The UID set in IMAP sequence-set syntax.
    #[must_use]
    pub fn uid_range(&self) -> String {
        if self.lower == self.upper {
            self.lower.to_string()
        } else {
            format!("{}:{}", self.lower, self.upper)
        }
    }

    /// The IMAP `UID SEARCH` criteria: UID range AND sender.
    #[must_use]
    pub fn imap_query(&self) -> String {
        format!("UID {} FROM \"{}\"", self.uid_range(), self.sender)
    }
}

impl fmt::Display for SearchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.uid_range(), self.sender)
    }
}
