fn main() {
    if !fork_grader::run() {
        std::process::exit(1);
    }
}
