//! Deterministic topic naming.
//!
//! One topic per message type, named by kebab-casing the wire name:
//!
//! | Message type      | Topic              |
//! |-------------------|--------------------|
//! | `AuctionCreated`  | `auction-created`  |
//! | `BidPlaced`       | `bid-placed`       |
//! | `AuctionFinished` | `auction-finished` |
//!
//! Each consumer group binds its own queue; messages that exhaust redelivery
//! on queue `q` are moved to `q-error`.

/// Suffix appended to a queue name to form its dead-letter topic.
pub const ERROR_SUFFIX: &str = "-error";

/// Topic a message type is published to.
///
/// # Example
///
/// ```
/// use gavel_core::topic::topic_for;
///
/// assert_eq!(topic_for("AuctionCreated"), "auction-created");
/// assert_eq!(topic_for("BidPlaced"), "bid-placed");
/// ```
#[must_use]
pub fn topic_for(message_type: &str) -> String {
    let mut topic = String::with_capacity(message_type.len() + 4);
    let mut prev_lower = false;
    for ch in message_type.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                topic.push('-');
            }
            topic.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            topic.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    topic
}

/// Dead-letter topic for a consumer queue.
#[must_use]
pub fn error_topic(queue: &str) -> String {
    format!("{queue}{ERROR_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_cases_message_types() {
        assert_eq!(topic_for("AuctionCreated"), "auction-created");
        assert_eq!(topic_for("AuctionUpdated"), "auction-updated");
        assert_eq!(topic_for("AuctionDeleted"), "auction-deleted");
        assert_eq!(topic_for("BidPlaced"), "bid-placed");
        assert_eq!(topic_for("AuctionFinished"), "auction-finished");
    }

    #[test]
    fn acronyms_stay_together() {
        assert_eq!(topic_for("HTTPPinged"), "httppinged");
        assert_eq!(topic_for("lower"), "lower");
    }

    #[test]
    fn error_topic_appends_suffix() {
        assert_eq!(error_topic("search"), "search-error");
    }
}
