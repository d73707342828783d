fn main() {
    snowtrail::run();
}
