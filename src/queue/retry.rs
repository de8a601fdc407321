use chrono::{DateTime, Duration, Utc};

use crate::models::connections::Connection;
use crate::models::item::RoutedItem;

/// Bounded, fixed-delay resend policy of one destination connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(retry_delay: Duration, max_attempts: u32) -> Self {
        Self {
            retry_delay,
            max_attempts,
        }
    }

    /// Never tried, or the last try is at least one retry delay old
    pub fn is_eligible(&self, item: &RoutedItem, now: DateTime<Utc>) -> bool {
        match item.last_attempt {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.retry_delay,
        }
    }

    /// Attempts beyond the maximum retire the item to the error archive
    pub fn is_exhausted(&self, item: &RoutedItem) -> bool {
        item.attempts > self.max_attempts
    }
}

impl From<&Connection> for RetryPolicy {
    fn from(connection: &Connection) -> Self {
        Self::new(connection.retry_delay(), connection.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::item::{far_future, ItemType};

    fn policy() -> RetryPolicy {
        let mut connection = Connection::new("pacs");
        connection.retry_delay_minutes = 5;
        connection.max_attempts = 3;
        RetryPolicy::from(&connection)
    }

    #[test]
    fn test_eligibility_follows_retry_delay() {
        let now = Utc::now();
        let mut item = RoutedItem::new("1", ItemType::File, "modality");
        assert!(policy().is_eligible(&item, now));

        item.last_attempt = Some(now - Duration::minutes(2));
        assert!(!policy().is_eligible(&item, now));

        item.last_attempt = Some(now - Duration::minutes(5));
        assert!(policy().is_eligible(&item, now));

        item.last_attempt = Some(far_future());
        assert!(!policy().is_eligible(&item, now));
    }

    #[test]
    fn test_exhausted_only_past_max_attempts() {
        let mut item = RoutedItem::new("1", ItemType::File, "modality");
        item.attempts = 3;
        assert!(!policy().is_exhausted(&item));
        item.attempts = 4;
        assert!(policy().is_exhausted(&item));
    }
}
