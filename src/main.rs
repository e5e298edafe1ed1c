fn main() {
    cosort::main();
}
