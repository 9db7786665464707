fn main() {
    if let Err(err) = cadence::cli::run_cadence() {
        tracing::error!(error = %err, "cadence failed");
        std::process::exit(1);
    }
}
