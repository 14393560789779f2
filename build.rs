use std::env;

fn main() {
    let default_config = env::var("MULTIJUJU_CONFIG").unwrap_or_else(|_| "multijuju.yaml".into());

    println!("cargo::rerun-if-env-changed=MULTIJUJU_CONFIG");
    println!("cargo::rustc-env=MULTIJUJU_DEFAULT_CONFIG={}", default_config);
}
