use crate::domain::event::TransferEvent;
use crate::error::{LedgerError, Result};

/// Reads transfer events from a newline-delimited JSON body.
///
/// Blank lines are skipped. Line numbers in errors are 1-based and count every
/// line of the body, blank or not.
pub struct EventReader<'a> {
    body: &'a str,
}

impl<'a> EventReader<'a> {
    pub fn new(body: &'a str) -> Self {
        Self { body }
    }

    /// Returns an iterator that lazily parses one event per non-blank line.
    pub fn events(self) -> impl Iterator<Item = Result<TransferEvent>> + 'a {
        self.body
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str(line).map_err(|source| LedgerError::MalformedEvent {
                    line: index + 1,
                    source,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"id":"5b0c4b4e-2b8a-4a43-9f0c-6f1f4e3b2a10","key":["5b0c4b4e-2b8a-4a43-9f0c-6f1f4e3b2a10"],"source":"0d6f2a3e-1c5b-4f7a-8e9d-2b3c4d5e6f70","destination":"9a8b7c6d-5e4f-4a3b-8c2d-1e0f9a8b7c6d"}"#;

    #[test]
    fn test_reader_valid_stream() {
        let body = format!("{VALID}\n{VALID}\n");
        let results: Vec<Result<TransferEvent>> = EventReader::new(&body).events().collect();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_reader_malformed_line() {
        let body = format!("{VALID}\n{{\"id\": 12\n{VALID}");
        let results: Vec<Result<TransferEvent>> = EventReader::new(&body).events().collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(LedgerError::MalformedEvent { line: 2, .. })
        ));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_reader_skips_blank_lines() {
        let body = format!("\n{VALID}\r\n   \n{VALID}\n\n");
        let results: Vec<Result<TransferEvent>> = EventReader::new(&body).events().collect();
        assert_eq!(results.len(), 2);
    }
}
