fn main() {
    humming_lib::run()
}
