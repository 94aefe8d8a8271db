//! Build script for natkeeper
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! shown by `natkeeper --version`.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
