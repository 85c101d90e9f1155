//! HTTP task built on `reqwest`.
use typed_builder::TypedBuilder;

use crate::task::{Reply, Task, TaskError};

/// GET request against `base_url` + `path` with a fixed query string.
///
/// Share one [`reqwest::Client`] between all the tasks of a set so every
/// virtual user draws from the same connection pool.
#[derive(Clone, Debug, TypedBuilder)]
pub struct HttpGet {
    client: reqwest::Client,
    #[builder(setter(into))]
    base_url: String,
    #[builder(setter(into))]
    path: String,
    #[builder(default)]
    query: Vec<(String, String)>,
}

impl HttpGet {
    /// Target URL without the query string.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }
}

impl Task for HttpGet {
    async fn call(&self) -> Result<Reply, TaskError> {
        let response = self
            .client
            .get(self.url())
            .query(&self.query)
            .send()
            .await
            .map_err(map_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_error)?;
        Ok(Reply::new(status, body.len()))
    }
}

fn map_error(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::Timeout
    } else {
        TaskError::Network(err.to_string())
    }
}
