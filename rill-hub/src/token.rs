//! Single-writer mutual exclusion per stream URL.

use shared::error::{Error, Result};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Grants at most one publish token per stream URL; a second publisher gets
/// a busy error until the first token drops.
#[derive(Default, Clone)]
pub struct PublishTokenManager {
    held: Rc<RefCell<HashSet<String>>>,
}

impl PublishTokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, stream_url: &str) -> Result<PublishToken> {
        let mut held = self.held.borrow_mut();
        if !held.insert(stream_url.to_string()) {
            return Err(Error::StreamBusy(stream_url.to_string()));
        }
        Ok(PublishToken {
            manager: self.held.clone(),
            stream_url: stream_url.to_string(),
        })
    }

    pub fn is_held(&self, stream_url: &str) -> bool {
        self.held.borrow().contains(stream_url)
    }
}

/// Releases the slot on drop, so an unwinding publish path can never leak
/// the stream.
pub struct PublishToken {
    manager: Rc<RefCell<HashSet<String>>>,
    stream_url: String,
}

impl Drop for PublishToken {
    fn drop(&mut self) {
        self.manager.borrow_mut().remove(&self.stream_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_publisher_rejected() {
        let m = PublishTokenManager::new();
        let _t = m.acquire("v/app/s").unwrap();
        assert!(matches!(
            m.acquire("v/app/s"),
            Err(Error::StreamBusy(_))
        ));
        // a different stream is fine
        assert!(m.acquire("v/app/other").is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let m = PublishTokenManager::new();
        {
            let _t = m.acquire("v/app/s").unwrap();
            assert!(m.is_held("v/app/s"));
        }
        assert!(!m.is_held("v/app/s"));
        assert!(m.acquire("v/app/s").is_ok());
    }
}
