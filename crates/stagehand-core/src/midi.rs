//! MIDI input parsing and MIDI-learn channel bindings.
//!
//! The [`MidiLearnBinder`] is a thin adapter: it turns controller-style
//! MIDI messages into channel writes. It never touches the channel bus
//! itself; the engine queues the writes it returns.

use serde::{Deserialize, Serialize};

/// MIDI message types parsed from raw MIDI bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on event (channel 0-15, note 0-127, velocity 1-127)
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off event (channel 0-15, note 0-127)
    NoteOff { channel: u8, note: u8 },
    /// Control change (channel, controller number, value)
    ControlChange { channel: u8, controller: u8, value: u8 },
    /// Pitch bend (channel, 14-bit value centered at 0)
    PitchBend { channel: u8, value: i16 },
    /// Channel aftertouch (channel pressure)
    ChannelAftertouch { channel: u8, pressure: u8 },
    /// MIDI clock tick (24 per quarter note)
    Clock,
    /// Start playback
    Start,
    /// Stop playback
    Stop,
    /// Continue playback
    Continue,
}

impl MidiMessage {
    /// Parse raw MIDI bytes into a MidiMessage.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (&status, data) = bytes.split_first()?;

        // System real-time messages (single byte, can appear anywhere)
        match status {
            0xF8 => return Some(MidiMessage::Clock),
            0xFA => return Some(MidiMessage::Start),
            0xFB => return Some(MidiMessage::Continue),
            0xFC => return Some(MidiMessage::Stop),
            _ => {}
        }

        let msg_type = status & 0xF0;
        let channel = status & 0x0F;

        match (msg_type, data) {
            (0x90, [note, velocity, ..]) => {
                // Note on with velocity 0 is a note off
                if *velocity == 0 {
                    Some(MidiMessage::NoteOff {
                        channel,
                        note: *note,
                    })
                } else {
                    Some(MidiMessage::NoteOn {
                        channel,
                        note: *note,
                        velocity: *velocity,
                    })
                }
            }
            (0x80, [note, _, ..]) => Some(MidiMessage::NoteOff {
                channel,
                note: *note,
            }),
            (0xB0, [controller, value, ..]) => Some(MidiMessage::ControlChange {
                channel,
                controller: *controller,
                value: *value,
            }),
            (0xE0, [lsb, msb, ..]) => {
                let value = ((*msb as i16) << 7) | *lsb as i16;
                Some(MidiMessage::PitchBend {
                    channel,
                    value: value - 8192,
                })
            }
            (0xD0, [pressure, ..]) => Some(MidiMessage::ChannelAftertouch {
                channel,
                pressure: *pressure,
            }),
            _ => None,
        }
    }

    /// The controller source and normalized (0.0-1.0) value, if this
    /// message is bindable.
    fn control(&self) -> Option<(u8, MidiSource, f64)> {
        match *self {
            MidiMessage::ControlChange {
                channel,
                controller,
                value,
            } => Some((channel, MidiSource::Controller(controller), value as f64 / 127.0)),
            MidiMessage::PitchBend { channel, value } => {
                Some((channel, MidiSource::PitchBend, (value as f64 + 8192.0) / 16383.0))
            }
            MidiMessage::ChannelAftertouch { channel, pressure } => {
                Some((channel, MidiSource::Aftertouch, pressure as f64 / 127.0))
            }
            _ => None,
        }
    }
}

/// Parameter curve for controller-to-channel mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterCurve {
    /// Linear interpolation (default)
    #[default]
    Linear,
    /// Logarithmic (more resolution at the low end, good for frequency)
    Logarithmic,
    /// Exponential (good for volume)
    Exponential,
}

impl ParameterCurve {
    /// Apply the curve to a normalized value (0.0-1.0).
    /// Returns a value in the range min-max.
    pub fn apply(&self, value: f64, min: f64, max: f64) -> f64 {
        let v = value.clamp(0.0, 1.0);
        let curved = match self {
            ParameterCurve::Linear => v,
            ParameterCurve::Logarithmic => (1.0 + 9.0 * v).log10(),
            ParameterCurve::Exponential => v * v,
        };
        min + curved * (max - min)
    }
}

/// Which part of a MIDI channel drives a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidiSource {
    /// Control change number
    Controller(u8),
    PitchBend,
    Aftertouch,
}

/// Binding of a MIDI controller to a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiBinding {
    /// MIDI channel filter (None = all channels)
    #[serde(default)]
    pub midi_channel: Option<u8>,
    pub source: MidiSource,
    /// Channel bus entry written by this binding
    pub target: String,
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub curve: ParameterCurve,
}

impl MidiBinding {
    /// Create a linear binding listening on all MIDI channels.
    pub fn new(source: MidiSource, target: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            midi_channel: None,
            source,
            target: target.into(),
            min,
            max,
            curve: ParameterCurve::default(),
        }
    }

    /// Restrict this binding to a single MIDI channel.
    pub fn on_channel(mut self, channel: u8) -> Self {
        self.midi_channel = Some(channel);
        self
    }

    /// Use a non-linear curve.
    pub fn with_curve(mut self, curve: ParameterCurve) -> Self {
        self.curve = curve;
        self
    }

    fn matches(&self, channel: u8, source: MidiSource) -> bool {
        self.source == source && self.midi_channel.map_or(true, |c| c == channel)
    }
}

/// Pending "learn" request: the next controller message binds to `target`.
#[derive(Debug, Clone, PartialEq)]
struct LearnRequest {
    target: String,
    min: f64,
    max: f64,
}

/// Maps MIDI controller messages onto channel writes.
#[derive(Debug, Clone, Default)]
pub struct MidiLearnBinder {
    bindings: Vec<MidiBinding>,
    learning: Option<LearnRequest>,
}

impl MidiLearnBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding. An existing binding for the same source and MIDI
    /// channel filter is replaced.
    pub fn bind(&mut self, binding: MidiBinding) {
        self.bindings
            .retain(|b| !(b.source == binding.source && b.midi_channel == binding.midi_channel));
        log::debug!(
            "[MIDI] bind {:?} (ch {:?}) -> {}",
            binding.source,
            binding.midi_channel,
            binding.target
        );
        self.bindings.push(binding);
    }

    /// Remove every binding that writes `target`. Returns how many were removed.
    pub fn unbind(&mut self, target: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.target != target);
        before - self.bindings.len()
    }

    /// Arm learn mode: the next controller message received becomes a
    /// binding to `target` with the given range.
    pub fn learn(&mut self, target: impl Into<String>, min: f64, max: f64) {
        let target = target.into();
        log::info!("[MIDI] learning controller for '{}'", target);
        self.learning = Some(LearnRequest { target, min, max });
    }

    pub fn cancel_learn(&mut self) {
        self.learning = None;
    }

    /// The channel name currently waiting for a controller, if any.
    pub fn learning(&self) -> Option<&str> {
        self.learning.as_ref().map(|l| l.target.as_str())
    }

    pub fn bindings(&self) -> &[MidiBinding] {
        &self.bindings
    }

    /// Replace all bindings (e.g. when importing saved control state).
    pub fn set_bindings(&mut self, bindings: Vec<MidiBinding>) {
        self.bindings = bindings;
    }

    /// Translate a MIDI message into `(channel name, value)` writes.
    pub fn handle(&mut self, message: &MidiMessage) -> Vec<(String, f64)> {
        let Some((channel, source, normalized)) = message.control() else {
            return Vec::new();
        };

        if let Some(request) = self.learning.take() {
            log::info!(
                "[MIDI] learned {:?} on channel {} for '{}'",
                source,
                channel,
                request.target
            );
            self.bind(
                MidiBinding::new(source, request.target, request.min, request.max)
                    .on_channel(channel),
            );
        }

        self.bindings
            .iter()
            .filter(|b| b.matches(channel, source))
            .map(|b| (b.target.clone(), b.curve.apply(normalized, b.min, b.max)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_change() {
        let msg = MidiMessage::from_bytes(&[0xB2, 7, 100]).unwrap();
        assert_eq!(
            msg,
            MidiMessage::ControlChange {
                channel: 2,
                controller: 7,
                value: 100
            }
        );
    }

    #[test]
    fn test_parse_note_on_zero_velocity_is_note_off() {
        let msg = MidiMessage::from_bytes(&[0x90, 60, 0]).unwrap();
        assert_eq!(msg, MidiMessage::NoteOff { channel: 0, note: 60 });
    }

    #[test]
    fn test_parse_pitch_bend_center() {
        let msg = MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]).unwrap();
        assert_eq!(msg, MidiMessage::PitchBend { channel: 0, value: 0 });
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(MidiMessage::from_bytes(&[]).is_none());
        assert!(MidiMessage::from_bytes(&[0xB0, 7]).is_none());
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), Some(MidiMessage::Clock));
    }

    #[test]
    fn test_curve_ranges() {
        for curve in [
            ParameterCurve::Linear,
            ParameterCurve::Logarithmic,
            ParameterCurve::Exponential,
        ] {
            assert!((curve.apply(0.0, 200.0, 8000.0) - 200.0).abs() < 1e-9);
            assert!((curve.apply(1.0, 200.0, 8000.0) - 8000.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_binding_maps_controller() {
        let mut binder = MidiLearnBinder::new();
        binder.bind(MidiBinding::new(MidiSource::Controller(74), "cutoff", 200.0, 8000.0));
        let writes = binder.handle(&MidiMessage::ControlChange {
            channel: 3,
            controller: 74,
            value: 127,
        });
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, "cutoff");
        assert!((writes[0].1 - 8000.0).abs() < 1e-9);

        let none = binder.handle(&MidiMessage::ControlChange {
            channel: 3,
            controller: 1,
            value: 10,
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_channel_filter() {
        let mut binder = MidiLearnBinder::new();
        binder.bind(MidiBinding::new(MidiSource::Controller(1), "mod", 0.0, 1.0).on_channel(0));
        assert!(binder
            .handle(&MidiMessage::ControlChange {
                channel: 1,
                controller: 1,
                value: 64
            })
            .is_empty());
    }

    #[test]
    fn test_learn_binds_next_controller() {
        let mut binder = MidiLearnBinder::new();
        binder.learn("amp", 0.0, 1.0);
        assert_eq!(binder.learning(), Some("amp"));

        // Notes are not bindable and leave learn mode armed
        binder.handle(&MidiMessage::NoteOn {
            channel: 0,
            note: 60,
            velocity: 100,
        });
        assert_eq!(binder.learning(), Some("amp"));

        let writes = binder.handle(&MidiMessage::ControlChange {
            channel: 5,
            controller: 21,
            value: 0,
        });
        assert_eq!(writes, vec![("amp".to_string(), 0.0)]);
        assert_eq!(binder.learning(), None);
        assert_eq!(binder.bindings()[0].midi_channel, Some(5));
        assert_eq!(binder.bindings()[0].source, MidiSource::Controller(21));
    }

    #[test]
    fn test_rebind_replaces_and_unbind() {
        let mut binder = MidiLearnBinder::new();
        binder.bind(MidiBinding::new(MidiSource::PitchBend, "bend", -1.0, 1.0));
        binder.bind(MidiBinding::new(MidiSource::PitchBend, "detune", -1.0, 1.0));
        assert_eq!(binder.bindings().len(), 1);
        assert_eq!(binder.unbind("detune"), 1);
        assert!(binder.bindings().is_empty());
    }
}
