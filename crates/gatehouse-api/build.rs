fn main() {
    println!("cargo::rustc-check-cfg=cfg(distribute)");

    if std::env::var("PROFILE").unwrap() == "distribute" {
        println!("cargo:rustc-cfg=distribute");
    }
}
