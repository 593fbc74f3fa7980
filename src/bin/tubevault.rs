#![forbid(unsafe_code)]

//! Command-line entry point. All behavior lives in the library; this binary
//! only forwards to the dispatcher and converts its result to an exit code.

#[tokio::main]
async fn main() {
    let code = tubevault::cli::run().await;
    std::process::exit(code);
}
