pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
                  _ _   _ _
 __      ____ _ (_) |_| (_)_ __   ___
 \ \ /\ / / _` || | __| | | '_ \ / _ \
  \ V  V / (_| || | |_| | | | | |  __/
   \_/\_/ \__,_||_|\__|_|_|_| |_|\___|
"#;
    const APP_DESCRIPTION: &str =
        "Least-recently-used worker dispatch broker over plain TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("WAITLINE_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
