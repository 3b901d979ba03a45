// Embed the git hash in --version. Optional; no git = plain crate version.
fn main() {
    let version = env!("CARGO_PKG_VERSION");
    let hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_owned())
        .filter(|hash| !hash.is_empty());

    match hash {
        Some(hash) => println!("cargo:rustc-env=FRAMECAP_VERSION={version} ({hash})"),
        None => println!("cargo:rustc-env=FRAMECAP_VERSION={version}"),
    }
}
