//! Server-wide counters surfaced by the HTTP API.

use std::cell::Cell;
use std::rc::Rc;

#[derive(Default)]
pub struct Stats {
    pub connections_total: Cell<u64>,
    pub connections_active: Cell<u64>,
    pub publishers: Cell<u64>,
    pub players: Cell<u64>,
    pub bytes_in: Cell<u64>,
    pub bytes_out: Cell<u64>,
}

impl Stats {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn on_connect(&self) {
        self.connections_total.set(self.connections_total.get() + 1);
        self.connections_active
            .set(self.connections_active.get() + 1);
    }

    pub fn on_disconnect(&self) {
        self.connections_active
            .set(self.connections_active.get().saturating_sub(1));
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.set(self.bytes_in.get() + n);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.set(self.bytes_out.get() + n);
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "code": 0,
            "server": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "data": {
                "connections": {
                    "total": self.connections_total.get(),
                    "active": self.connections_active.get(),
                },
                "publishers": self.publishers.get(),
                "players": self.players.get(),
                "bytes_in": self.bytes_in.get(),
                "bytes_out": self.bytes_out.get(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_accounting() {
        let s = Stats::new();
        s.on_connect();
        s.on_connect();
        s.on_disconnect();
        assert_eq!(s.connections_total.get(), 2);
        assert_eq!(s.connections_active.get(), 1);
    }

    #[test]
    fn test_summary_shape() {
        let s = Stats::new();
        s.add_bytes_in(10);
        let v = s.summary_json();
        assert_eq!(v["code"], 0);
        assert_eq!(v["data"]["bytes_in"], 10);
    }
}
