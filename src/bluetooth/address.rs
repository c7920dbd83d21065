// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MAC address canonicalisation and BlueZ object path helpers.

/// Canonical MAC form: uppercase hex pairs separated by colons.
///
/// Accepts `:`, `-` or `_` separated input in any case.
pub fn canonical_mac(input: &str) -> Option<String> {
    let parts: Vec<&str> = input.split([':', '-', '_']).collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(parts.join(":").to_ascii_uppercase())
}

/// Extract the device MAC from an object path.
///
/// Works for the device path itself and for anything nested below it
/// (services, characteristics, battery objects).
pub fn mac_from_path(path: &str) -> Option<String> {
    path.split('/')
        .find_map(|segment| segment.strip_prefix("dev_"))
        .and_then(canonical_mac)
}

/// Object path of the device with the given MAC below `adapter_path`.
pub fn device_path(adapter_path: &str, mac: &str) -> Option<String> {
    let mac = canonical_mac(mac)?;
    Some(format!(
        "{}/dev_{}",
        adapter_path.trim_end_matches('/'),
        mac.replace(':', "_")
    ))
}

/// True if `path` is `parent` or nested below it.
pub fn is_under(path: &str, parent: &str) -> bool {
    path == parent
        || (path.starts_with(parent) && path.as_bytes().get(parent.len()) == Some(&b'/'))
}
