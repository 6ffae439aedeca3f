/// TCP port of the External Control Protocol (ECP) HTTP API
pub const ECP_PORT: u16 = 8060;

/// SSDP search target answered by ECP devices
pub const SSDP_SEARCH_TARGET: &str = "roku:ecp";

/// SSDP multicast group and port
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250:1900";

/// App name the device reports while its home screen is in the foreground
pub const HOME_APP_NAME: &str = "Roku";

/// Label published for the home screen
pub const HOME_LABEL: &str = "Home";

/// Prefix of literal-character key codes, e.g. `Lit_a`
pub const LITERAL_KEY_PREFIX: &str = "Lit_";
