//! JSON wire format for the bidirectional generative-audio channel.

use crate::{
    audio,
    models::{ConversationContext, Voice},
};
use serde::{Deserialize, Serialize};

/// Mime tag attached to every outbound microphone chunk.
pub const MIC_CHUNK_MIME: &str = "audio/pcm;rate=16000";

// --- Client messages ---

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub speech_config: SpeechConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Audio,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Serialize, Debug)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug)]
pub struct Part {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Builds the one-time handshake message: model id, audio response modality,
/// the selected voice and the system instruction interpolated from the
/// conversation context.
pub fn setup_message(model: &str, voice: Voice, context: &ConversationContext) -> ClientMessage {
    ClientMessage::Setup(Setup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec![ResponseModality::Audio],
            speech_config: SpeechConfig {
                voice_config: VoiceConfig {
                    prebuilt_voice_config: PrebuiltVoiceConfig {
                        voice_name: voice.as_str().to_string(),
                    },
                },
            },
        },
        system_instruction: Content {
            parts: vec![Part {
                text: system_instruction(context),
            }],
        },
    })
}

fn system_instruction(context: &ConversationContext) -> String {
    format!(
        "You are SynergyMind, an elite strategic consultant. The user has shared \
         this breakthrough insight: \"{}\".\n\nKey opportunity identified: {}\n\n\
         Engage in a thoughtful voice conversation to help them explore this idea \
         deeply. Ask clarifying questions, provide strategic insights, and help \
         them develop an action plan.",
        context.big_picture, context.hidden_opportunity
    )
}

/// Wraps one captured block of f32 samples as a steady-state audio message.
pub fn audio_chunk(samples: &[f32]) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: MIC_CHUNK_MIME.to_string(),
            data: audio::encode_f32_to_base64_i16(samples),
        }],
    })
}

// --- Server messages ---

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    /// Barge-in: currently playing synthesized audio must be discarded.
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

#[derive(Deserialize, Debug)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<ServerBlob>,
}

#[derive(Deserialize, Debug)]
pub struct ServerBlob {
    pub data: String,
}
