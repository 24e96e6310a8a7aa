fn main() {
    passbridge_app_lib::run()
}
