//! Built-in device tools.

use crate::error::RegistryError;
use crate::mcp::registry::{ToolDescriptor, ToolRegistryBuilder};
use crate::mcp::schema::ParameterSchema;
use serde_json::{Value, json};
use std::sync::Arc;

pub const GET_DEVICE_STATUS: &str = "self.get_device_status";
pub const SET_VOLUME: &str = "self.audio_speaker.set_volume";
pub const PLAY_SOUND: &str = "self.audio_speaker.play_sound";

/// What the built-in tools may touch. Implementations must be safe to call
/// from several tool threads at once.
pub trait DeviceControl: Send + Sync {
    /// Snapshot of device state, speaker and network.
    fn device_status(&self) -> Value;

    /// # Errors
    ///
    /// A message when the codec rejects the volume.
    fn set_volume(&self, volume: u8) -> Result<(), String>;

    /// # Errors
    ///
    /// A message for unknown sounds or a stopped pipeline.
    fn play_sound(&self, name: &str) -> Result<(), String>;
}

/// Register the built-in tools.
///
/// # Errors
///
/// Fails if any of the names is already registered.
pub fn register_device_tools(
    builder: &mut ToolRegistryBuilder,
    device: &Arc<dyn DeviceControl>,
) -> Result<(), RegistryError> {
    let d = Arc::clone(device);
    builder.register(ToolDescriptor::new(
        GET_DEVICE_STATUS,
        "Current device status: state, speaker volume and network. \
         Call this before changing a setting to learn its current value.",
        ParameterSchema::new(),
        move |_| Ok(d.device_status()),
    ))?;

    let d = Arc::clone(device);
    builder.register(ToolDescriptor::new(
        SET_VOLUME,
        "Set the speaker volume.",
        ParameterSchema::new()
            .integer("volume", 0, 100)
            .describe("Volume percentage"),
        move |args| {
            let volume = args
                .get_i64("volume")
                .and_then(|v| u8::try_from(v).ok())
                .ok_or("volume out of range")?;
            d.set_volume(volume)?;
            Ok(json!(true))
        },
    ))?;

    let d = Arc::clone(device);
    builder.register(ToolDescriptor::new(
        PLAY_SOUND,
        "Play a short sound cue on the speaker.",
        ParameterSchema::new()
            .string("sound")
            .describe("Cue name, e.g. popup or success"),
        move |args| {
            let sound = args.get_str("sound").ok_or("missing sound")?;
            d.play_sound(sound)?;
            Ok(json!(true))
        },
    ))?;
    Ok(())
}
