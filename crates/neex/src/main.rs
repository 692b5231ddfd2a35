fn main() {
    std::process::exit(neex_lib::main());
}
