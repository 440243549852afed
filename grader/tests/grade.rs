fn main() {
    assert!(fork_grader::run(), "some grader tests failed");
}
