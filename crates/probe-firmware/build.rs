//! Bakes optional factory WiFi credentials from `.env` into the binary and
//! sets up the esp-hal linker script.

fn main() {
    println!("cargo:rerun-if-changed=.env");

    match dotenvy::dotenv_iter() {
        Ok(entries) => {
            for (key, value) in entries.flatten() {
                if key == "PROBE_WIFI_SSID" || key == "PROBE_WIFI_PASSWORD" {
                    println!("cargo:rustc-env={key}={value}");
                }
            }
        }
        Err(_) => println!("cargo:warning=no .env found, building without factory WiFi credentials"),
    }

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
