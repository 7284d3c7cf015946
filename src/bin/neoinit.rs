fn main() {
    std::process::exit(neoinit::run_service_manager());
}
