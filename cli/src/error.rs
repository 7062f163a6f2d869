use std::process::ExitCode;

pub type CliResult<T> = anyhow::Result<T>;

/// Convert a CliResult to an ExitCode, printing errors to stderr
///
/// A function that was reached but failed exits with 2, every other failure
/// with 1.
pub fn to_exit_code(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            match e.downcast_ref::<lipc::Error>() {
                Some(lipc::Error::Validation(_) | lipc::Error::Execution(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
