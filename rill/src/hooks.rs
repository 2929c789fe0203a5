//! HTTP callback hooks.
//!
//! Authorizing hooks (`on_connect`, `on_publish`, `on_play`) run inline:
//! any non-200 answer denies the request. Notification hooks (`on_close`,
//! `on_stop`, `on_unpublish`) are queued on a background worker coroutine
//! so publishers never block on hook latency.

use crate::config::HooksConfig;
use hub::Request;
use log::{debug, warn};
use runtime::{CondWaiter, Coroutine};
use serde_json::json;
use shared::error::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

pub struct HookClient {
    client: reqwest::Client,
    config: RefCell<HooksConfig>,
    worker: RefCell<Option<Rc<Coroutine>>>,
    queue: Rc<RefCell<VecDeque<(String, serde_json::Value)>>>,
    wakeup: CondWaiter,
}

impl HookClient {
    pub fn new(config: HooksConfig) -> Rc<Self> {
        Rc::new(Self {
            client: reqwest::Client::new(),
            config: RefCell::new(config),
            worker: RefCell::new(None),
            queue: Rc::new(RefCell::new(VecDeque::new())),
            wakeup: CondWaiter::new(),
        })
    }

    pub fn update_config(&self, config: HooksConfig) {
        *self.config.borrow_mut() = config;
    }

    /// Launches the async delivery worker.
    pub fn start(self: &Rc<Self>) {
        let co = Rc::new(Coroutine::new("hook-worker"));
        let this = Rc::clone(self);
        co.start(move |ctx| async move {
            loop {
                ctx.pull()?;
                this.wakeup.wait_timeout(Duration::from_secs(1)).await;
                loop {
                    let task = this.queue.borrow_mut().pop_front();
                    let Some((url, body)) = task else { break };
                    if let Err(e) = this.post(&url, &body).await {
                        warn!("async hook {url} failed: {e}");
                    }
                }
            }
        });
        *self.worker.borrow_mut() = Some(co);
    }

    pub async fn stop(&self) {
        let co = self.worker.borrow_mut().take();
        if let Some(co) = co {
            co.stop().await;
        }
    }

    fn body(action: &str, client_id: u64, req: &Request) -> serde_json::Value {
        json!({
            "action": action,
            "client_id": client_id,
            "ip": req.ip,
            "vhost": req.vhost,
            "app": req.app,
            "stream": req.stream,
            "param": req.param,
            "tcUrl": req.tc_url,
        })
    }

    async fn post(&self, url: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| Error::Internal(format!("hook {url}: {e}")))?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(Error::HttpStatus(status));
        }
        Ok(())
    }

    /// Runs an authorizing hook against every configured URL; the first
    /// failure denies.
    async fn authorize(&self, urls: Vec<String>, action: &str, client_id: u64, req: &Request) -> Result<()> {
        let body = Self::body(action, client_id, req);
        for url in urls {
            self.post(&url, &body).await.map_err(|e| {
                warn!("hook {action} denied by {url}: {e}");
                Error::HookDenied {
                    action: action.to_string(),
                    status: match e {
                        Error::HttpStatus(s) => s,
                        _ => 0,
                    },
                }
            })?;
        }
        Ok(())
    }

    /// Queues a notification hook on the worker.
    fn notify(&self, urls: Vec<String>, action: &str, client_id: u64, req: &Request) {
        if urls.is_empty() {
            return;
        }
        let body = Self::body(action, client_id, req);
        let mut q = self.queue.borrow_mut();
        for url in urls {
            q.push_back((url, body.clone()));
        }
        drop(q);
        self.wakeup.signal();
        debug!("queued {action} hooks");
    }

    pub async fn on_connect(&self, client_id: u64, req: &Request) -> Result<()> {
        let urls = self.config.borrow().on_connect.clone();
        self.authorize(urls, "on_connect", client_id, req).await
    }

    pub async fn on_publish(&self, client_id: u64, req: &Request) -> Result<()> {
        let urls = self.config.borrow().on_publish.clone();
        self.authorize(urls, "on_publish", client_id, req).await
    }

    pub async fn on_play(&self, client_id: u64, req: &Request) -> Result<()> {
        let urls = self.config.borrow().on_play.clone();
        self.authorize(urls, "on_play", client_id, req).await
    }

    pub fn on_unpublish(&self, client_id: u64, req: &Request) {
        let urls = self.config.borrow().on_unpublish.clone();
        self.notify(urls, "on_unpublish", client_id, req);
    }

    pub fn on_stop(&self, client_id: u64, req: &Request) {
        let urls = self.config.borrow().on_stop.clone();
        self.notify(urls, "on_stop", client_id, req);
    }

    pub fn on_close(&self, client_id: u64, req: &Request) {
        let urls = self.config.borrow().on_close.clone();
        self.notify(urls, "on_close", client_id, req);
    }

    /// Asks the backend where to redirect a player whose stream is not
    /// local; returns the first URL the backend names, if any.
    pub async fn on_forward_backend(&self, client_id: u64, req: &Request) -> Result<Option<String>> {
        let urls = self.config.borrow().on_forward_backend.clone();
        let body = Self::body("on_forward_backend", client_id, req);
        for url in urls {
            let resp = self
                .client
                .post(&url)
                .json(&body)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map_err(|e| Error::Internal(format!("hook {url}: {e}")))?;
            if resp.status().as_u16() != 200 {
                continue;
            }
            let v: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| Error::Internal(format!("hook {url}: {e}")))?;
            if let Some(first) = v["data"]["urls"].as_array().and_then(|a| a.first()) {
                if let Some(s) = first.as_str() {
                    return Ok(Some(s.to_string()));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_shape() {
        let req = Request::from_tc_url("rtmp://h/live?vhost=v", "s?k=1").unwrap();
        let body = HookClient::body("on_publish", 7, &req);
        assert_eq!(body["action"], "on_publish");
        assert_eq!(body["client_id"], 7);
        assert_eq!(body["vhost"], "v");
        assert_eq!(body["stream"], "s");
        assert_eq!(body["param"], "vhost=v&k=1");
    }

    #[tokio::test]
    async fn test_empty_hooks_authorize() {
        let hooks = HookClient::new(HooksConfig::default());
        let req = Request::default();
        hooks.on_connect(1, &req).await.unwrap();
        hooks.on_publish(1, &req).await.unwrap();
        hooks.on_play(1, &req).await.unwrap();
    }

    #[test]
    fn test_notify_queues() {
        let hooks = HookClient::new(HooksConfig {
            on_close: vec!["http://127.0.0.1:1/cb".into()],
            ..Default::default()
        });
        hooks.on_close(1, &Request::default());
        assert_eq!(hooks.queue.borrow().len(), 1);
    }
}
