// MIDI device management.
//
// Owns the midir connections. The input callback feeds raw bytes straight
// into the pipeline; the output connection is shared with the worker's
// echo path. Device errors abort the operation and are reported, the
// pipeline keeps running without that device.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Result, anyhow, bail};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::info;

use keyharp_control::ControlCommand;
use keyharp_core::pipeline::Pipeline;
use keyharp_core::worker::MidiSink;
use keyharp_midi::message::CC_ALL_NOTES_OFF;

const CLIENT_NAME: &str = "keyharp";

/// Output connection shared between the device manager and the worker.
#[derive(Clone, Default)]
pub struct SharedMidiOut {
    conn: Arc<Mutex<Option<MidiOutputConnection>>>,
}

impl SharedMidiOut {
    pub fn new() -> SharedMidiOut {
        SharedMidiOut::default()
    }
}

impl MidiSink for SharedMidiOut {
    fn send(&mut self, message: &[u8]) -> Result<()> {
        if let Some(conn) = self.conn.lock().unwrap().as_mut() {
            conn.send(message)?;
        }
        Ok(())
    }
}

pub struct DeviceManager {
    pipeline: Pipeline,
    input: Option<MidiInputConnection<()>>,
    input_index: Option<usize>,
    output: SharedMidiOut,
    output_index: Option<usize>,
}

impl DeviceManager {
    pub fn new(pipeline: Pipeline, output: SharedMidiOut) -> DeviceManager {
        DeviceManager {
            pipeline,
            input: None,
            input_index: None,
            output,
            output_index: None,
        }
    }

    pub fn list_inputs() -> Result<Vec<String>> {
        let midi_in = MidiInput::new(CLIENT_NAME)?;
        Ok(midi_in
            .ports()
            .iter()
            .map(|port| {
                midi_in
                    .port_name(port)
                    .unwrap_or_else(|_| "unknown".to_string())
            })
            .collect())
    }

    pub fn list_outputs() -> Result<Vec<String>> {
        let midi_out = MidiOutput::new(CLIENT_NAME)?;
        Ok(midi_out
            .ports()
            .iter()
            .map(|port| {
                midi_out
                    .port_name(port)
                    .unwrap_or_else(|_| "unknown".to_string())
            })
            .collect())
    }

    /// Open an input port; its callback stamps arrival times and submits
    /// into the pipeline.
    pub fn open_input(&mut self, index: usize) -> Result<()> {
        self.close_input();
        let midi_in = MidiInput::new(CLIENT_NAME)?;
        let ports = midi_in.ports();
        let Some(port) = ports.get(index) else {
            bail!("no such input device: {index}");
        };
        let name = midi_in
            .port_name(port)
            .unwrap_or_else(|_| "unknown".to_string());
        let pipeline = self.pipeline.clone();
        let conn = midi_in
            .connect(
                port,
                CLIENT_NAME,
                move |_timestamp, message, _| {
                    pipeline.submit_realtime(message, Instant::now());
                },
                (),
            )
            .map_err(|e| anyhow!("failed to open input {index}: {e}"))?;
        info!(index, name = %name, "midi input opened");
        self.input = Some(conn);
        self.input_index = Some(index);
        Ok(())
    }

    pub fn close_input(&mut self) {
        if let Some(conn) = self.input.take() {
            conn.close();
            info!("midi input closed");
        }
        self.input_index = None;
    }

    /// Open an output port and re-select the stored instrument on it.
    pub fn open_output(&mut self, index: usize) -> Result<()> {
        self.close_output();
        let midi_out = MidiOutput::new(CLIENT_NAME)?;
        let ports = midi_out.ports();
        let Some(port) = ports.get(index) else {
            bail!("no such output device: {index}");
        };
        let name = midi_out
            .port_name(port)
            .unwrap_or_else(|_| "unknown".to_string());
        let conn = midi_out
            .connect(port, CLIENT_NAME)
            .map_err(|e| anyhow!("failed to open output {index}: {e}"))?;
        *self.output.conn.lock().unwrap() = Some(conn);
        self.output_index = Some(index);
        info!(index, name = %name, "midi output opened");
        self.pipeline.resend_instrument();
        Ok(())
    }

    pub fn close_output(&mut self) {
        if let Some(mut conn) = self.output.conn.lock().unwrap().take() {
            // Silence anything still sounding before the device goes away.
            let _ = conn.send(&[0xB0, CC_ALL_NOTES_OFF, 0x00]);
            conn.close();
            info!("midi output closed");
        }
        self.output_index = None;
    }

    pub fn input_index(&self) -> Option<usize> {
        self.input_index
    }

    pub fn output_index(&self) -> Option<usize> {
        self.output_index
    }
}

fn format_listing(names: &[String], selected: Option<usize>) -> String {
    if names.is_empty() {
        return "none".to_string();
    }
    names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let marker = if Some(i) == selected { "*" } else { "" };
            format!("{i}{marker}:{name}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// `input-device [n|off]` — list, select, or close the input device.
pub struct InputDeviceCommand {
    pub manager: Arc<Mutex<DeviceManager>>,
}

impl ControlCommand for InputDeviceCommand {
    fn name(&self) -> &str {
        "input-device"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        let mut manager = self.manager.lock().unwrap();
        if args.is_empty() {
            let names = DeviceManager::list_inputs()?;
            return Ok(Some(format_listing(&names, manager.input_index())));
        }
        if args == "off" {
            manager.close_input();
            return Ok(Some("off".to_string()));
        }
        let index: usize = args.parse()?;
        manager.open_input(index)?;
        Ok(Some(format!("input-device {index}")))
    }
}

/// `output-device [n|off]` — list, select, or close the output device.
pub struct OutputDeviceCommand {
    pub manager: Arc<Mutex<DeviceManager>>,
}

impl ControlCommand for OutputDeviceCommand {
    fn name(&self) -> &str {
        "output-device"
    }

    fn run(&self, args: &str) -> Result<Option<String>> {
        let mut manager = self.manager.lock().unwrap();
        if args.is_empty() {
            let names = DeviceManager::list_outputs()?;
            return Ok(Some(format_listing(&names, manager.output_index())));
        }
        if args == "off" {
            manager.close_output();
            return Ok(Some("off".to_string()));
        }
        let index: usize = args.parse()?;
        manager.open_output(index)?;
        Ok(Some(format!("output-device {index}")))
    }
}
