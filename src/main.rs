fn main() {
    pbf_fluids::platform::start();
}
