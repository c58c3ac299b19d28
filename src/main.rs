fn main() {
    socksicle_lib::run()
}
