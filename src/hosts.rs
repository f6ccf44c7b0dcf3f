// ABOUTME: Region code to LibreView API hostname resolution
// ABOUTME: Maps US/EU/CA codes to regional hosts, passes explicit hostnames through
//
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Default host when no region or explicit hostname is given
pub const DEFAULT_HOST: &str = "api.libreview.io";
/// United States regional host
pub const US_HOST: &str = "api-us.libreview.io";
/// European regional host
pub const EU_HOST: &str = "api-eu.libreview.io";
/// Canadian regional host
pub const CA_HOST: &str = "api-ca.libreview.io";

/// Resolve a region code or explicit hostname to a LibreView API host.
///
/// `"US"`, `"EU"` and `"CA"` (case-insensitive) map to the fixed regional
/// hosts. A value containing a dot is taken as an explicit hostname and
/// returned verbatim. Anything else falls back to the global default.
/// Called for initial configuration and whenever the server issues a
/// redirect instruction naming a region.
#[must_use]
pub fn resolve_host(server: &str) -> String {
    match server.to_uppercase().as_str() {
        "US" => US_HOST.to_owned(),
        "EU" => EU_HOST.to_owned(),
        "CA" => CA_HOST.to_owned(),
        _ if server.contains('.') => server.to_owned(),
        _ => DEFAULT_HOST.to_owned(),
    }
}
