fn main() -> Result<(), Box<dyn std::error::Error>> {
    mcpmux::cli::main()
}
