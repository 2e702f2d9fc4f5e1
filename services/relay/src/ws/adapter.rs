//! Protocol adapter for the telephony variant.
//!
//! The telephony gateway only speaks media frames, so translation is
//! deliberately narrow: media frames map to agent audio frames and back,
//! everything else (other events, malformed JSON, missing fields) is
//! dropped without touching the session.

use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct MediaEnvelope {
    event: String,
    media: Option<MediaPayload>,
}

#[derive(Serialize, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Serialize)]
struct MediaOut<'a> {
    event: &'static str,
    media: MediaPayloadOut<'a>,
}

#[derive(Serialize)]
struct MediaPayloadOut<'a> {
    payload: &'a str,
}

#[derive(Deserialize)]
struct AgentEnvelope {
    #[serde(rename = "type")]
    kind: String,
    audio: Option<String>,
}

#[derive(Serialize)]
struct AgentAudioIn<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: &'a str,
}

/// Translates one inbound telephony frame into an agent `input_audio`
/// frame. Returns `None` for anything that is not a well-formed media frame.
pub fn telephony_to_agent(text: &str) -> Option<String> {
    let envelope: MediaEnvelope = serde_json::from_str(text).ok()?;
    if envelope.event != "media" {
        return None;
    }
    let payload = envelope.media?.payload;
    serde_json::to_string(&AgentAudioIn {
        kind: "input_audio",
        audio: &payload,
    })
    .ok()
}

/// Translates one agent frame back into a telephony media frame. Only
/// `output_audio` frames produce output.
pub fn agent_to_telephony(text: &str) -> Option<String> {
    let envelope: AgentEnvelope = serde_json::from_str(text).ok()?;
    if envelope.kind != "output_audio" {
        return None;
    }
    let audio = envelope.audio?;
    serde_json::to_string(&MediaOut {
        event: "media",
        media: MediaPayloadOut { payload: &audio },
    })
    .ok()
}
