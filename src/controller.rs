// src/controller.rs
//
// High-level operations on a CAN Bus Triple.
//
// Each operation builds one command with the encoder, hands it to the link and
// maps the response into a domain result. Retries are left to the caller.

use tokio::sync::broadcast;

use crate::config::LinkConfig;
use crate::io::cbt::command::EEPROM_CHUNK_LEN;
use crate::io::cbt::eeprom::SETTINGS_SIZE;
use crate::io::{CanMode, CbtLink, Command, Expect, IoError, JsonReply, LinkEvent, Settings};

/// Reply value the device uses for a stored EEPROM chunk
const SAVE_SUCCESS: &str = "success";

pub struct CbtController {
    link: CbtLink,
}

impl CbtController {
    pub fn new(link: CbtLink) -> Self {
        Self { link }
    }

    /// Controller for the serial port named in `config`.
    #[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
    pub fn serial(config: LinkConfig) -> Self {
        Self::new(CbtLink::serial(config))
    }

    pub fn link(&self) -> &CbtLink {
        &self.link
    }

    pub fn config(&self) -> &LinkConfig {
        self.link.config()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    pub fn is_busy(&self) -> bool {
        self.link.is_busy()
    }

    // ========================================================================
    // Generic
    // ========================================================================

    pub fn connect(&self) -> Result<(), IoError> {
        self.link.open()
    }

    /// Cancel whatever is pending and close the link.
    pub fn disconnect(&self) {
        self.link.cancel(true);
    }

    pub fn set_port(&self, name: &str) -> Result<(), IoError> {
        self.link.set_port(name)
    }

    /// Send raw bytes and return the first response rendered as text.
    pub async fn send_command(&self, bytes: &[u8]) -> Result<String, IoError> {
        let reply = self.link.any(&Command::raw(bytes, Expect::Any)).await?;
        Ok(reply.to_string())
    }

    pub fn cancel_command(&self, close: bool) {
        self.link.cancel(close);
    }

    // ========================================================================
    // System
    // ========================================================================

    pub async fn system_info(&self) -> Result<JsonReply, IoError> {
        self.link.json(&Command::system_info()).await
    }

    /// Raw EEPROM image; empty when the reply carries no `data` key.
    pub async fn dump_eeprom(&self) -> Result<Vec<u8>, IoError> {
        let reply = self.link.json(&Command::dump_eeprom()).await?;
        match reply.get("data") {
            Some(data) => hex::decode(data.trim())
                .map_err(|e| IoError::protocol(&self.link.name(), format!("EEPROM dump is not hex: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Write a full image in 32-byte chunks. Every chunk must be acknowledged
    /// with success before the next one is sent.
    pub async fn save_eeprom(&self, image: &[u8]) -> Result<(), IoError> {
        if image.len() != SETTINGS_SIZE {
            return Err(IoError::format(format!(
                "invalid EEPROM size {} (expected {} bytes)",
                image.len(),
                SETTINGS_SIZE
            )));
        }

        let opened = !self.link.is_open();
        if opened {
            self.link.open()?;
        }

        let result = self.save_chunks(image).await;

        if opened {
            if let Err(e) = self.link.close() {
                tlog!("[controller] Failed to close after EEPROM save: {}", e);
            }
        }
        result
    }

    async fn save_chunks(&self, image: &[u8]) -> Result<(), IoError> {
        for (index, chunk) in image.chunks(EEPROM_CHUNK_LEN).enumerate() {
            let cmd = Command::save_eeprom_chunk(index as u8, chunk)?;
            let reply = self.link.json(&cmd).await?;
            if reply.get("result").map(String::as_str) != Some(SAVE_SUCCESS) {
                tlog!("[controller] EEPROM chunk {} rejected: {:?}", index, reply);
                return Err(IoError::device(
                    &self.link.name(),
                    format!("error saving EEPROM (chunk {})", index),
                ));
            }
        }
        Ok(())
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), IoError> {
        let image = settings.to_bytes()?;
        self.save_eeprom(&image).await
    }

    pub async fn settings(&self) -> Result<Settings, IoError> {
        let image = self.dump_eeprom().await?;
        Settings::from_bytes(&image)
    }

    pub async fn show_settings(&self) -> Result<Vec<(String, String)>, IoError> {
        Ok(self.settings().await?.to_map())
    }

    pub async fn reset_eeprom(&self) -> Result<JsonReply, IoError> {
        self.link.json(&Command::reset_eeprom()).await
    }

    /// Reboot into the bootloader. The device drops off the port, so the link
    /// is closed afterwards.
    pub async fn restart_bootloader(&self) -> Result<(), IoError> {
        self.link.blind(&Command::restart_bootloader()).await?;
        self.link.close()
    }

    pub async fn auto_baud_rate(&self, bus: u8) -> Result<JsonReply, IoError> {
        self.link.json(&Command::auto_baud_rate(bus)?).await
    }

    pub async fn set_bit_rate(&self, bus: u8, rate: u32) -> Result<JsonReply, IoError> {
        self.link.json(&Command::bit_rate(bus, rate)?).await
    }

    pub async fn bus_status(&self, bus: u8) -> Result<JsonReply, IoError> {
        self.link.json(&Command::bus_status(bus)?).await
    }

    /// Current mode of a bus; `Unknown` when the reply has no usable `mode`.
    pub async fn can_mode(&self, bus: u8) -> Result<CanMode, IoError> {
        let reply = self.link.json(&Command::get_can_mode(bus)?).await?;
        Ok(reply
            .get("mode")
            .map(|mode| CanMode::from_name(mode))
            .unwrap_or(CanMode::Unknown))
    }

    /// Change the mode of a bus. The device must echo the new mode back.
    pub async fn set_can_mode(&self, bus: u8, mode: CanMode) -> Result<(), IoError> {
        let reply = self.link.json(&Command::set_can_mode(bus, mode)?).await?;
        match reply.get("mode") {
            Some(echoed) if echoed == mode.name() => Ok(()),
            echoed => Err(IoError::device(
                &self.link.name(),
                format!("error changing CAN mode to {} (device reports {:?})", mode, echoed),
            )),
        }
    }

    // ========================================================================
    // CAN
    // ========================================================================

    pub async fn send_can_packet(&self, bus: u8, id: &[u8], data: &[u8]) -> Result<(), IoError> {
        self.link.blind(&Command::can_packet(bus, id, data)?).await
    }

    // ========================================================================
    // Logging
    // ========================================================================

    pub async fn disable_log(&self, bus: u8) -> Result<bool, IoError> {
        self.link.ok(&Command::bus_log(bus, false, 0, 0)?).await
    }

    pub async fn enable_log(&self, bus: u8, filter1: u32, filter2: u32) -> Result<bool, IoError> {
        self.link.ok(&Command::bus_log(bus, true, filter1, filter2)?).await
    }

    pub async fn enable_log_with_mask(
        &self,
        bus: u8,
        filter1: u32,
        mask1: u32,
        filter2: u32,
        mask2: u32,
    ) -> Result<bool, IoError> {
        let cmd = Command::bus_log_mask(bus, filter1, mask1, filter2, mask2)?;
        self.link.ok(&cmd).await
    }

    // ========================================================================
    // Bluetooth
    // ========================================================================

    pub async fn set_bluetooth_filter(&self, bus: u8, enabled: bool, filter1: u32, filter2: u32) -> Result<(), IoError> {
        self.link
            .blind(&Command::bluetooth_filter(bus, enabled, filter1, filter2)?)
            .await
    }

    pub async fn reset_bluetooth(&self) -> Result<(), IoError> {
        self.link.blind(&Command::bluetooth_reset()).await
    }

    pub async fn bluetooth_passthrough(&self, enabled: bool) -> Result<(), IoError> {
        self.link.blind(&Command::bluetooth_passthrough(enabled)).await
    }

    // ========================================================================
    // Misc
    // ========================================================================

    pub async fn sleep_timer(&self, activate: bool) -> Result<(), IoError> {
        self.link.blind(&Command::sleep_timer(activate)).await
    }

    /// Show text on the vehicle LCD (up to 65 characters).
    pub async fn display_message(&self, text: &str) -> Result<(), IoError> {
        self.link.blind(&Command::lcd_message(text)).await
    }
}
