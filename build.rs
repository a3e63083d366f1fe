fn main() {
    println!("cargo:rerun-if-changed=Info.plist");

    // CoreBluetooth keeps the central in the "unauthorized" state for any
    // process without an NSBluetoothAlwaysUsageDescription entry.  A plain
    // CLI has no bundle, so the plist goes into the __TEXT,__info_plist
    // section of the `miband` executable instead.
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "macos" {
        return;
    }
    let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };
    for arg in [
        "-sectcreate".to_string(),
        "__TEXT".to_string(),
        "__info_plist".to_string(),
        format!("{manifest_dir}/Info.plist"),
    ] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
}
