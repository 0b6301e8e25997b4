pub mod http;

use async_trait::async_trait;
use url::Url;

use crate::error::{ ClientError, Result };
use crate::models::chat::{ AudioUpload, Conversation, Message, Role, SearchResult, Summary };
use crate::recording::AudioClip;

pub use self::http::HttpTransport;

/// Request/response contract of the backend. Owns no conversation state.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_conversation(
        &self,
        doctor_language: &str,
        patient_language: &str,
        title: Option<&str>
    ) -> Result<Conversation>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation>;

    async fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<Conversation>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;

    async fn send_message(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        audio_url: Option<&str>
    ) -> Result<Message>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;

    async fn generate_summary(&self, conversation_id: &str) -> Result<Summary>;

    async fn upload_audio(&self, clip: &AudioClip) -> Result<AudioUpload>;

    async fn fetch_audio(&self, reference: &str) -> Result<Vec<u8>>;

    /// Address of the push channel bound to `conversation_id`.
    fn stream_url(&self, conversation_id: &str) -> Result<Url>;
}

/// Resolves every backend address from the configured API base.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    pub fn new(api_base: &str) -> Result<Self> {
        let base = Url::parse(api_base)?;
        match base.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ClientError::validation(format!("Unsupported API scheme: {}", other)));
            }
        }
        if base.cannot_be_a_base() {
            return Err(ClientError::validation(format!("Invalid API base: {}", api_base)));
        }
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn api(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::validation("API base cannot carry a path"))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    pub fn search(&self, query: &str) -> Result<Url> {
        let mut url = self.api(&["conversations", "search"])?;
        url.query_pairs_mut().append_pair("q", query);
        Ok(url)
    }

    /// Audio references are either absolute or relative to the API origin.
    pub fn audio(&self, reference: &str) -> Result<Url> {
        if reference.starts_with("http") {
            return Ok(Url::parse(reference)?);
        }
        let base = self.base.as_str().trim_end_matches('/');
        if reference.starts_with('/') {
            Ok(Url::parse(&format!("{}{}", base, reference))?)
        } else {
            Ok(Url::parse(&format!("{}/{}", base, reference))?)
        }
    }

    pub fn stream(&self, conversation_id: &str) -> Result<Url> {
        let mut url = self.base.clone();
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_|
            ClientError::validation(format!("Cannot derive stream url from {}", self.base))
        )?;
        url.path_segments_mut()
            .map_err(|_| ClientError::validation("API base cannot carry a path"))?
            .pop_if_empty()
            .push("ws")
            .push(conversation_id);
        url.set_query(None);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_paths_keep_base_prefix() {
        let root = Endpoints::new("http://localhost:8000").unwrap();
        assert_eq!(
            root.api(&["conversations", "c1", "messages"]).unwrap().as_str(),
            "http://localhost:8000/api/conversations/c1/messages"
        );

        let prefixed = Endpoints::new("https://clinic.example/backend/").unwrap();
        assert_eq!(
            prefixed.api(&["messages"]).unwrap().as_str(),
            "https://clinic.example/backend/api/messages"
        );
    }

    #[test]
    fn search_query_is_encoded() {
        let endpoints = Endpoints::new("http://localhost:8000").unwrap();
        let url = endpoints.search("chest pain & fever").unwrap();
        assert_eq!(url.path(), "/api/conversations/search");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs, vec![("q".to_string(), "chest pain & fever".to_string())]);
    }

    #[test]
    fn audio_references_resolve_against_origin() {
        let endpoints = Endpoints::new("http://localhost:8000/").unwrap();
        assert_eq!(
            endpoints.audio("/api/audio/tts_1.wav").unwrap().as_str(),
            "http://localhost:8000/api/audio/tts_1.wav"
        );
        assert_eq!(
            endpoints.audio("https://cdn.example/a.webm").unwrap().as_str(),
            "https://cdn.example/a.webm"
        );
    }

    #[test]
    fn stream_url_maps_scheme() {
        let plain = Endpoints::new("http://localhost:8000").unwrap();
        assert_eq!(plain.stream("c1").unwrap().as_str(), "ws://localhost:8000/ws/c1");

        let tls = Endpoints::new("https://clinic.example").unwrap();
        assert_eq!(tls.stream("c2").unwrap().as_str(), "wss://clinic.example/ws/c2");
    }

    #[test]
    fn rejects_non_http_base() {
        assert!(Endpoints::new("ftp://example.com").is_err());
        assert!(Endpoints::new("not a url").is_err());
    }
}
