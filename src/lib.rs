pub mod api;
pub mod cli;
pub mod error;
pub mod models;
pub mod recording;
pub mod search;
pub mod store;
pub mod sync;
pub mod view;

#[cfg(test)]
mod testing;

use api::{ HttpTransport, Transport };
use cli::Args;
use log::info;
use search::SearchDebouncer;
use std::error::Error;
use std::sync::Arc;
use sync::{ SyncConfig, SyncEngine };
use view::{ Terminal, TerminalOptions };

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("API URL: {}", args.api_url);
    info!("Role: {}", args.role);
    info!("Heartbeat: {}s", args.heartbeat().as_secs());
    info!("Request Timeout: {:?}", args.request_timeout());
    info!("Reconnect: {:?}", args.reconnect_policy());
    info!("Search Debounce: {}ms (min {} chars)", args.search_debounce_ms, args.search_min_chars);
    info!("Default Languages: {} -> {}", args.doctor_language, args.patient_language);
    info!("Max Recording: {} bytes", args.max_recording_bytes);
    if let Some(conversation_id) = &args.conversation_id {
        info!("Initial Conversation: {}", conversation_id);
    }
    info!("-------------------------");

    let http = HttpTransport::new(&args.api_url, args.request_timeout())?;
    let transport: Arc<dyn Transport> = Arc::new(http);

    let handle = SyncEngine::spawn(transport.clone(), SyncConfig {
        heartbeat: args.heartbeat(),
    });
    let search = SearchDebouncer::new(transport, args.search_delay(), args.search_min_chars);
    let (terminal, reconnects) = Terminal::new(handle, args.role, search, TerminalOptions {
        reconnect: args.reconnect_policy(),
        max_recording_bytes: args.max_recording_bytes,
        doctor_language: args.doctor_language.clone(),
        patient_language: args.patient_language.clone(),
    });
    terminal.run(reconnects, args.conversation_id.clone()).await?;

    info!("Session ended");
    Ok(())
}
