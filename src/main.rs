use std::process::ExitCode;

fn main() -> ExitCode {
    robolink_lib::run()
}
