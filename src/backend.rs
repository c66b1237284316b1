use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::POLL_REQUEST_TIMEOUT;
use crate::error::{Error, Result};

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    pub arch: String,
}

impl CreateTaskRequest {
    pub fn for_host(repo_name: Option<String>) -> Self {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "x86_64" => "amd64",
            other => other,
        };
        Self {
            repo_name,
            arch: arch.to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateTaskResponse {
    pub id: String,
    pub client_key: String,
    pub client_ca_certificate: String,
    pub root_ca_certificate: String,
    #[serde(default)]
    pub sticky_disks_enabled: bool,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStatusResponse {
    #[serde(default)]
    pub ec2_instance: Option<Ec2Instance>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ec2Instance {
    pub instance_ip: String,
}

/// The control plane that hands out build instances.
#[async_trait::async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<CreateTaskResponse>;

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse>;

    async fn abandon_task(&self, task_id: &str) -> Result<()>;

    async fn complete_task(&self, task_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, token: impl AsRef<str>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.as_ref()))
            .map_err(|_| Error::Config("BUILDER_API_TOKEN"))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("Accept", HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(POLL_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::network(&base_url, e))?;
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<CreateTaskResponse> {
        let url = self.url("");
        let res = send_and_handle_unexpected(&url, self.client.post(&url).json(request)).await?;
        res.json().await.map_err(|e| Error::network(&url, e))
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse> {
        let url = self.url(task_id);
        let res = send_and_handle_unexpected(&url, self.client.get(&url)).await?;
        res.json().await.map_err(|e| Error::network(&url, e))
    }

    async fn abandon_task(&self, task_id: &str) -> Result<()> {
        let url = self.url(&format!("{task_id}/abandon"));
        send_and_handle_unexpected(&url, self.client.post(&url)).await?;
        Ok(())
    }

    async fn complete_task(&self, task_id: &str) -> Result<()> {
        let url = self.url(&format!("{task_id}/complete"));
        send_and_handle_unexpected(&url, self.client.post(&url)).await?;
        Ok(())
    }
}

async fn send_and_handle_unexpected(url: &str, builder: RequestBuilder) -> Result<Response> {
    let res = builder.send().await.map_err(|e| Error::network(url, e))?;
    match res.status() {
        status if status.is_success() => Ok(res),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Backend {
            url: url.to_string(),
            status: res.status(),
            body: "backend rejected the API token".to_string(),
        }),
        status => Err(Error::Backend {
            url: url.to_string(),
            status,
            body: res.text().await.unwrap_or_default(),
        }),
    }
}
