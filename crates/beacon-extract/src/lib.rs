//! Beacon note location + customer-information field extraction.
//!
//! The embedded support widget posts a note whose HTML body holds a table of
//! `$$name$$value` cells under a "Customer Information" heading.

use beacon_core::{BeaconExtraction, BeaconFieldSet, Conversation, Thread};
use scraper::{Html, Selector};
use thiserror::Error;

pub const CRATE_NAME: &str = "beacon-extract";

pub const CUSTOMER_INFORMATION_HEADING: &str = "Customer Information";
pub const FIELD_DELIMITER: &str = "$$";

const HEADING_SELECTOR: &str = "h1, h2, h3, h4, h5, h6";
const TABLE_SELECTOR: &str = "table";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

fn parse_selector(selector: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector,
        message: e.to_string(),
    })
}

/// Strategy for picking the table that belongs to a heading.
pub trait TableLocator {
    /// Full text content of the chosen table, or `None` when nothing matches.
    fn locate_table_text(&self, document: &Html, heading: &str) -> Result<Option<String>, ExtractError>;
}

/// Pairs headings and tables by their ordinal position across the whole
/// document: the n-th matching heading selects the n-th table, whatever
/// actually sits between them.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdinalTableLocator;

impl TableLocator for OrdinalTableLocator {
    fn locate_table_text(&self, document: &Html, heading: &str) -> Result<Option<String>, ExtractError> {
        let headings = parse_selector(HEADING_SELECTOR)?;
        let tables = parse_selector(TABLE_SELECTOR)?;

        let Some(position) = document
            .select(&headings)
            .position(|h| h.text().collect::<String>().trim() == heading)
        else {
            return Ok(None);
        };

        Ok(document
            .select(&tables)
            .nth(position)
            .map(|t| t.text().collect::<String>()))
    }
}

/// First thread posted by the widget form, if any.
pub fn locate_beacon_note(conversation: &Conversation) -> Option<&Thread> {
    conversation
        .threads
        .as_deref()?
        .iter()
        .find(|t| t.is_beacon_note())
}

/// Splits `$$name$$value$$name$$value...` into ordered pairs.
///
/// Text before the first delimiter is discarded and tokens are trimmed. A
/// trailing name with no value token after it is dropped.
pub fn parse_field_tokens(text: &str) -> BeaconFieldSet {
    let mut tokens = text.split(FIELD_DELIMITER).skip(1).map(str::trim);
    let mut fields = BeaconFieldSet::new();
    while let (Some(name), Some(value)) = (tokens.next(), tokens.next()) {
        fields.insert(name, value);
    }
    fields
}

/// Reads the customer-information table out of a note body.
pub fn extract_fields(
    body: &str,
    locator: &dyn TableLocator,
) -> Result<Option<BeaconFieldSet>, ExtractError> {
    let document = Html::parse_document(body);
    Ok(locator
        .locate_table_text(&document, CUSTOMER_INFORMATION_HEADING)?
        .map(|text| parse_field_tokens(&text)))
}

#[derive(Debug, Clone, Default)]
pub struct BeaconExtractor<L = OrdinalTableLocator> {
    locator: L,
}

impl BeaconExtractor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<L: TableLocator> BeaconExtractor<L> {
    pub fn with_locator(locator: L) -> Self {
        Self { locator }
    }

    /// Only the first beacon note is considered; if its body does not
    /// parse, later notes are not tried.
    pub fn extract(&self, conversation: &Conversation) -> Result<Option<BeaconExtraction>, ExtractError> {
        let Some(note) = locate_beacon_note(conversation) else {
            return Ok(None);
        };
        let Some(body) = note.body.as_deref() else {
            return Ok(None);
        };
        Ok(extract_fields(body, &self.locator)?.map(|fields| BeaconExtraction {
            conversation_id: conversation.id.clone(),
            fields,
        }))
    }
}

pub fn extract(conversation: &Conversation) -> Result<Option<BeaconExtraction>, ExtractError> {
    BeaconExtractor::new().extract(conversation)
}
