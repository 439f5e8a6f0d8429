// Control surface view model: what the user sees and what a button press asks for.
// The view is rebuilt from the durable pair on attach, never from past events,
// and then follows lifecycle events while attached.

use anyhow::Result;

use crate::session::lifecycle::LifecycleEvent;
use crate::session::persistence::{DurableStore, ListenState};
use crate::session::protocol::ChannelId;

pub const LISTEN_LABEL: &str = "Listen";
pub const STOP_LABEL: &str = "Stop Listening";

/// What a listen press asks the supervisor to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlIntent {
    Start(ChannelId),
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlSurface {
    listening: bool,
    channel_id: String,
}

impl ControlSurface {
    /// Build the view from the durable pair
    pub fn attach(store: &dyn DurableStore) -> Result<Self> {
        Ok(Self::from_state(&ListenState::load(store)?))
    }

    pub fn from_state(state: &ListenState) -> Self {
        Self {
            listening: state.desired_connected,
            channel_id: state.channel_id.clone(),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Last channel the user listened on, for pre-filling the input
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn apply(&mut self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::Started { channel_id } => {
                self.listening = true;
                self.channel_id = channel_id.clone();
            }
            LifecycleEvent::Stopped => self.listening = false,
        }
    }

    /// Toggle listening. Flips the view right away; a Stopped event from a
    /// failed connect flips it back.
    pub fn listen_pressed(&mut self, input: &str) -> Option<ControlIntent> {
        if self.listening {
            self.listening = false;
            return Some(ControlIntent::Stop);
        }

        let channel_id = ChannelId::new(input.trim()).ok()?;
        self.listening = true;
        self.channel_id = channel_id.to_string();
        Some(ControlIntent::Start(channel_id))
    }

    pub fn click_pressed(&self, input: &str) -> Option<ChannelId> {
        ChannelId::new(input.trim()).ok()
    }

    pub fn button_label(&self) -> &'static str {
        if self.listening {
            STOP_LABEL
        } else {
            LISTEN_LABEL
        }
    }

    pub fn info_line(&self) -> Option<String> {
        self.listening
            .then(|| format!("Listening on '{}'", self.channel_id))
    }
}
