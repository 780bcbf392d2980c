use canopy_registry::RegistryError;

/// sysexits.h codes for failures the host can classify.
mod exit_codes {
    pub const GENERAL_ERROR: i32 = 1;
    pub const UNAVAILABLE: i32 = 69;
    pub const IOERR: i32 = 74;
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<RegistryError>() {
        Some(RegistryError::Spawn(_)) => exit_codes::UNAVAILABLE,
        Some(RegistryError::Persistence { .. }) => exit_codes::IOERR,
        _ => exit_codes::GENERAL_ERROR,
    }
}

fn main() {
    if let Err(e) = canopy::run() {
        eprintln!("Error: {e:#}");
        std::process::exit(exit_code_for(&e));
    }
}
