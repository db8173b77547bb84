//! HTTP implementation of the Scheduler Unit client.
//!
//! Message pages are fetched 1000 at a time and flattened into a stream;
//! transient page-fetch failures retry with bounded backoff before the
//! error reaches the consumer.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::instrument;

use crate::model::{MessageMeta, Process, ScheduledMessage};
use crate::ordinate::Ordinate;

use super::{MessageBound, MessageStream, SchedulerUnit, SuError, SuTimestamp};

const PAGE_SIZE: usize = 1000;
const FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct HttpSchedulerUnit {
    http: reqwest::Client,
}

impl Default for HttpSchedulerUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSchedulerUnit {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SuError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = async {
                self.http
                    .get(url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<T>()
                    .await
            }
            .await;
            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < FETCH_ATTEMPTS => {
                    tracing::debug!(url, attempt, error = %e, "scheduler unit fetch retry");
                    tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(SuError::Http(e)),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagePage {
    page_info: PageInfo,
    edges: Vec<MessageEdge>,
}

#[derive(Debug, Deserialize)]
struct PageInfo {
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
struct MessageEdge {
    cursor: String,
    node: ScheduledMessage,
}

struct StreamState {
    client: HttpSchedulerUnit,
    page_url: String,
    cursor: String,
    bound: MessageBound,
    buffer: VecDeque<ScheduledMessage>,
    exhausted: bool,
}

#[async_trait]
impl SchedulerUnit for HttpSchedulerUnit {
    #[instrument(skip(self, su_url), err)]
    async fn load_process(&self, su_url: &str, process_id: &str) -> Result<Process, SuError> {
        let url = format!("{}/processes/{process_id}", su_url.trim_end_matches('/'));
        self.get_json(&url).await
    }

    #[instrument(skip(self, su_url), err)]
    async fn load_timestamp(
        &self,
        su_url: &str,
        process_id: &str,
    ) -> Result<SuTimestamp, SuError> {
        let url = format!(
            "{}/timestamp?process-id={process_id}",
            su_url.trim_end_matches('/')
        );
        self.get_json(&url).await
    }

    #[instrument(skip(self, su_url), err)]
    async fn load_message_meta(
        &self,
        su_url: &str,
        process_id: &str,
        message_id: &str,
    ) -> Result<MessageMeta, SuError> {
        let url = format!(
            "{}/{message_id}?process-id={process_id}",
            su_url.trim_end_matches('/')
        );
        self.get_json(&url).await
    }

    fn load_messages(
        &self,
        su_url: &str,
        process_id: &str,
        from: Ordinate,
        bound: MessageBound,
    ) -> MessageStream {
        let state = StreamState {
            client: self.clone(),
            page_url: format!("{}/{process_id}", su_url.trim_end_matches('/')),
            cursor: from.as_str().to_string(),
            bound,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        futures_util::stream::try_unfold(state, |mut st| async move {
            loop {
                if let Some(message) = st.buffer.pop_front() {
                    if !st.bound.admits(&message) {
                        // Past the target; drop the rest of the stream.
                        return Ok(None);
                    }
                    return Ok(Some((message, st)));
                }
                if st.exhausted {
                    return Ok(None);
                }

                let url = format!(
                    "{}?from={}&limit={PAGE_SIZE}",
                    st.page_url,
                    urlencode(&st.cursor)
                );
                let page: MessagePage = st.client.get_json(&url).await?;
                st.exhausted = !page.page_info.has_next_page || page.edges.is_empty();
                if let Some(last) = page.edges.last() {
                    st.cursor = last.cursor.clone();
                }
                st.buffer.extend(page.edges.into_iter().map(|e| e.node));
            }
        })
        .boxed()
    }
}

/// Percent-encode the few reserved characters an ordinate cursor can carry.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            ':' => out.push_str("%3A"),
            '+' => out.push_str("%2B"),
            '/' => out.push_str("%2F"),
            '&' => out.push_str("%26"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_encoding_covers_ordinate_forms() {
        assert_eq!(urlencode("42"), "42");
        assert_eq!(urlencode("1500:3:ab+c"), "1500%3A3%3Aab%2Bc");
    }
}
