/// A remote-control button understood by `POST /keypress/<command>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    /// Catalog identifier, e.g. `VOLUME_MUTE`
    pub key: &'static str,

    /// Wire-level key code, e.g. `VolumeMute`
    pub command: &'static str,

    /// Display name, e.g. `Volume Mute`
    pub name: &'static str,
}

const fn entry(key: &'static str, command: &'static str, name: &'static str) -> KeyEntry {
    KeyEntry { key, command, name }
}

/// Every named key of the ECP keypress API.
pub const KEY_CATALOG: &[KeyEntry] = &[
    entry("BACK", "Back", "Back"),
    entry("BACKSPACE", "Backspace", "Backspace"),
    entry("CHANNEL_DOWN", "ChannelDown", "Channel Down"),
    entry("CHANNEL_UP", "ChannelUp", "Channel Up"),
    entry("DOWN", "Down", "Down"),
    entry("ENTER", "Enter", "Enter"),
    entry("FIND_REMOTE", "FindRemote", "Find Remote"),
    entry("FORWARD", "Fwd", "Forward"),
    entry("HOME", "Home", "Home"),
    entry("INFO", "Info", "Info"),
    entry("INPUT_AV1", "InputAV1", "Input AV1"),
    entry("INPUT_HDMI1", "InputHDMI1", "Input HDMI 1"),
    entry("INPUT_HDMI2", "InputHDMI2", "Input HDMI 2"),
    entry("INPUT_HDMI3", "InputHDMI3", "Input HDMI 3"),
    entry("INPUT_HDMI4", "InputHDMI4", "Input HDMI 4"),
    entry("INPUT_TUNER", "InputTuner", "Input Tuner"),
    entry("INSTANT_REPLAY", "InstantReplay", "Instant Replay"),
    entry("LEFT", "Left", "Left"),
    entry("PLAY", "Play", "Play"),
    entry("POWER", "Power", "Power"),
    entry("POWER_OFF", "PowerOff", "Power Off"),
    entry("POWER_ON", "PowerOn", "Power On"),
    entry("REVERSE", "Rev", "Reverse"),
    entry("RIGHT", "Right", "Right"),
    entry("SEARCH", "Search", "Search"),
    entry("SELECT", "Select", "Select"),
    entry("UP", "Up", "Up"),
    entry("VOLUME_DOWN", "VolumeDown", "Volume Down"),
    entry("VOLUME_MUTE", "VolumeMute", "Volume Mute"),
    entry("VOLUME_UP", "VolumeUp", "Volume Up"),
];
