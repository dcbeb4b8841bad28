fn main() {
    owlivion_sweep_lib::run()
}
