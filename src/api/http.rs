use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, Response };
use reqwest::multipart::{ Form, Part };
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::{ Endpoints, Transport };
use crate::error::{ ClientError, Result };
use crate::models::chat::{
    AudioUpload,
    Conversation,
    CreateConversationRequest,
    Message,
    RenameConversationRequest,
    Role,
    SearchResult,
    SendMessageRequest,
    Summary,
    DEFAULT_TITLE,
};
use crate::recording::AudioClip;

const UPLOAD_FILENAME: &str = "recording.webm";

#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    endpoints: Endpoints,
}

impl HttpTransport {
    /// `timeout` of `None` leaves requests bounded only by the OS and server.
    pub fn new(api_base: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            endpoints: Endpoints::new(api_base)?,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let resp = check_status(resp).await?;
    Ok(resp.json::<T>().await?)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
        title: Option<&str>
    ) -> Result<Conversation> {
        let url = self.endpoints.api(&["conversations"])?;
        let title = title.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TITLE);
        let body = CreateConversationRequest {
            title,
            doctor_language,
            patient_language,
        };
        debug!("POST {} ({} -> {})", url, doctor_language, patient_language);
        let resp = self.http.post(url).json(&body).send().await?;
        read_json(resp).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let url = self.endpoints.api(&["conversations"])?;
        debug!("GET {}", url);
        read_json(self.http.get(url).send().await?).await
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let url = self.endpoints.api(&["conversations", conversation_id])?;
        debug!("GET {}", url);
        read_json(self.http.get(url).send().await?).await
    }

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<Conversation> {
        let url = self.endpoints.api(&["conversations", conversation_id])?;
        debug!("PATCH {}", url);
        let resp = self.http
            .patch(url)
            .json(&(RenameConversationRequest { title }))
            .send().await?;
        read_json(resp).await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let url = self.endpoints.api(&["conversations", conversation_id])?;
        debug!("DELETE {}", url);
        check_status(self.http.delete(url).send().await?).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        audio_url: Option<&str>
    ) -> Result<Message> {
        let url = self.endpoints.api(&["messages"])?;
        let body = SendMessageRequest {
            conversation_id,
            role,
            text,
            audio_url,
        };
        debug!("POST {} as {} in {}", url, role, conversation_id);
        read_json(self.http.post(url).json(&body).send().await?).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let url = self.endpoints.api(&["conversations", conversation_id, "messages"])?;
        debug!("GET {}", url);
        read_json(self.http.get(url).send().await?).await
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let url = self.endpoints.search(query)?;
        debug!("GET {}", url);
        read_json(self.http.get(url).send().await?).await
    }

    async fn generate_summary(&self, conversation_id: &str) -> Result<Summary> {
        let url = self.endpoints.api(&["conversations", conversation_id, "summary"])?;
        debug!("POST {}", url);
        read_json(self.http.post(url).send().await?).await
    }

    async fn upload_audio(&self, clip: &AudioClip) -> Result<AudioUpload> {
        let url = self.endpoints.api(&["audio", "upload"])?;
        let part = Part::bytes(clip.bytes.clone())
            .file_name(UPLOAD_FILENAME)
            .mime_str(&clip.mime)?;
        let form = Form::new().part("file", part);
        debug!("POST {} ({} bytes)", url, clip.bytes.len());
        read_json(self.http.post(url).multipart(form).send().await?).await
    }

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>> {
        let url = self.endpoints.audio(reference)?;
        debug!("GET {}", url);
        let resp = check_status(self.http.get(url).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    fn stream_url(&self, conversation_id: &str) -> Result<Url> {
        self.endpoints.stream(conversation_id)
    }
}
