//! Internal module for parsing full messages on the fallback path.

use crate::error::{Error, Result};
use crate::extractor::{extract_code, OtpCode};
use crate::mailbox::CandidateMessage;
use mailparse::{parse_mail, DispositionType, ParsedMail};
use tracing::{debug, warn};

/// Result of attempting to extract a code from a message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExtractResult {
    /// A code was found
    Match(OtpCode),
    /// No code in this message
    NoMatch,
    /// Message couldn't be parsed (logged, but can continue to next message)
    ParseError,
}

/// Plain-text and HTML bodies of a message.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MessageBodies {
    pub text: Option<String>,
    pub html: Option<String>,
}

impl MessageBodies {
    /// Text and HTML joined by a single space, missing parts as empty strings.
    pub fn combined(&self) -> String {
        format!(
            "{} {}",
            self.text.as_deref().unwrap_or_default(),
            self.html.as_deref().unwrap_or_default()
        )
    }
}

/// Extracts a code from the full raw message held by `message`.
///
/// This function is designed to be resilient - it will log and skip malformed
/// messages rather than failing the retrieval.
pub(crate) fn extract_code_from_full_message(message: &CandidateMessage) -> ExtractResult {
    let uid = message.uid;

    let Some(raw) = message.body.as_deref() else {
        debug!(uid, "Message has no body");
        return ExtractResult::NoMatch;
    };

    let bodies = match parse_bodies(uid, raw) {
        Ok(bodies) => bodies,
        Err(e) => {
            warn!(uid, error = %e, "Failed to parse email, skipping message");
            return ExtractResult::ParseError;
        }
    };

    match extract_code(Some(&bodies.combined())) {
        Some(code) => {
            debug!(uid, "Found code in parsed message");
            ExtractResult::Match(code)
        }
        None => {
            debug!(uid, "No code found in parsed message");
            ExtractResult::NoMatch
        }
    }
}

/// Parses a raw RFC 5322 message into its first plain-text and HTML bodies.
pub(crate) fn parse_bodies(uid: u32, raw: &[u8]) -> Result<MessageBodies> {
    let parsed = parse_mail(raw).map_err(|source| Error::ParseEmail { uid, source })?;

    let mut bodies = MessageBodies::default();
    collect_bodies(&parsed, &mut bodies).map_err(|source| Error::ParseEmail { uid, source })?;

    Ok(bodies)
}

/// Walks the MIME tree depth first, keeping the first inline leaf of each kind.
fn collect_bodies(
    part: &ParsedMail<'_>,
    bodies: &mut MessageBodies,
) -> std::result::Result<(), mailparse::MailParseError> {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            collect_bodies(subpart, bodies)?;
        }
        return Ok(());
    }

    if matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    ) {
        return Ok(());
    }

    let slot = match part.ctype.mimetype.to_lowercase().as_str() {
        "text/plain" => &mut bodies.text,
        "text/html" => &mut bodies.html,
        _ => return Ok(()),
    };
    if slot.is_none() {
        *slot = Some(part.get_body()?);
    }

    Ok(())
}
