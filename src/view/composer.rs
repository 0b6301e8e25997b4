/// Text the user is typing. Cleared optimistically when a send starts and
/// put back if the send fails.
#[derive(Debug, Default, Clone)]
pub struct Composer {
    text: String,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Takes the trimmed text for sending. Empty input stays put and yields `None`.
    pub fn take(&mut self) -> Option<String> {
        let trimmed = self.text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let taken = trimmed.to_string();
        self.text.clear();
        Some(taken)
    }

    pub fn restore(&mut self, text: String) {
        self.text = text;
    }
}
